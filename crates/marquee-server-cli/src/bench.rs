use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::warn;

use marquee::wire::{WireCodec, WireFrame};

use crate::args::BenchArgs;
use crate::lobby::ECHO;

#[derive(Debug, Default, Clone, Copy)]
struct ClientReport {
    round_trips: usize,
    slowest: Duration,
}

/// Sends `messages` echo frames one at a time and waits for each answer.
async fn run_client(addr: SocketAddr, client: usize, messages: usize) -> Result<ClientReport> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, WireCodec::default());
    let mut writer = FramedWrite::new(write_half, WireCodec::default());

    let mut report = ClientReport::default();
    for seq in 0..messages {
        let mut frame = WireFrame::with_ids(ECHO, 1);
        frame.insert("client", client);
        frame.insert("seq", seq);

        let sent = Instant::now();
        writer.send(frame).await?;
        let echo = reader
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("server closed the connection"))??;
        if echo.get("seq").and_then(|v| v.as_u64()) != Some(seq as u64) {
            anyhow::bail!("client {} got an out of order echo: {:?}", client, echo);
        }

        report.round_trips += 1;
        report.slowest = report.slowest.max(sent.elapsed());
    }
    Ok(report)
}

pub async fn run_bench(args: &BenchArgs) -> Result<()> {
    println!(
        "Benchmarking {} with {} clients x {} messages",
        args.addr, args.clients, args.messages
    );
    let started = Instant::now();

    let clients: Vec<_> = (0..args.clients)
        .map(|client| tokio::spawn(run_client(args.addr, client, args.messages)))
        .collect();

    let mut total = 0usize;
    let mut failed = 0usize;
    let mut slowest = Duration::ZERO;
    for (client, task) in clients.into_iter().enumerate() {
        match task.await {
            Ok(Ok(report)) => {
                total += report.round_trips;
                slowest = slowest.max(report.slowest);
            }
            Ok(Err(e)) => {
                warn!("Client {} failed: {}", client, e);
                failed += 1;
            }
            Err(e) => {
                warn!("Client {} panicked: {}", client, e);
                failed += 1;
            }
        }
    }

    let elapsed = started.elapsed();
    let rate = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{} round trips in {:.2?} ({:.0}/s), slowest {:.2?}, {} clients failed",
        total, elapsed, rate, slowest, failed
    );
    if failed > 0 {
        anyhow::bail!("{} of {} clients failed", failed, args.clients);
    }
    Ok(())
}
