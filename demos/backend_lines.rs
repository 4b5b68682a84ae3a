use job_sync::*;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Lines as a pose-detection backend prints them.
    let lines = [
        "",
        "[STEP] Splitting video into chunks...",
        r#"[PROGRESS] {"type": "progress", "phase": "chunking", "percent": 5, "message": "Splitting video into chunks"}"#,
        r#"[PROGRESS] {"type": "progress", "phase": "detecting", "percent": 47.5, "current": 190, "total": 400}"#,
        "[WARNING] low keypoint confidence on frame 212",
        r#"[LOG] {"level": "debug", "message": "batch size 16"}"#,
        "Loaded yolov8n-pose.pt",
    ];

    for line in lines {
        match decode_line("demo-job", line) {
            Some(event) => println!("{:<18} {}", event.channel(), serde_json::to_string(&event)?),
            None => println!("{:<18} (skipped)", "-"),
        }
    }

    // Same thing, streamed from a reader into an event channel.
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let output = lines.join("\n");
    let sent = pump_lines("demo-job", BufReader::new(output.as_bytes()), &tx).await?;
    drop(tx);

    let mut received = 0;
    while rx.recv().await.is_some() {
        received += 1;
    }
    println!("Forwarded {} events, received {}", sent, received);
    Ok(())
}
