use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use pb::kv_service_client::KvServiceClient;
use pb::{GetRequest, PutRequest};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// INTERVAL ms
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Server address
    #[arg(short, long, default_value = "grpc://127.0.0.1:4001")]
    server: String,

    /// Size of each written value in bytes
    #[arg(short, long, default_value = "64")]
    value_size: usize,

    /// Number of distinct keys written
    #[arg(short, long, default_value = "1000")]
    keys: u64,
}

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("kv");
}

/// One write-then-read against the target before the load starts, so a
/// follower or unreachable node fails fast instead of polluting the run.
async fn probe(server_addr: &str) {
    let mut client = match KvServiceClient::connect(server_addr.to_string()).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to connect to server: {}", e);
            return;
        }
    };
    let request = tonic::Request::new(PutRequest {
        key: "benchmark-probe".to_string(),
        value: b"ok".to_vec(),
    });
    match client.put(request).await {
        Ok(response) => println!(
            "Probe write committed at log index {}",
            response.get_ref().log_index
        ),
        Err(e) => eprintln!("Probe write failed (is this node the leader?): {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Connect to the server
    let server_addr = args.server.clone();
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3).unwrap()));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients, target INTERVAL: {}",
        args.concurrency, args.interval
    );

    probe(&server_addr).await;

    // Spawn client tasks
    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let server_addr = server_addr.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let value_size = args.value_size;
        let keys = args.keys;
        let interval = args.interval;

        let handle = tokio::spawn(async move {
            let mut client = match KvServiceClient::connect(server_addr).await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("Failed to connect to server: {}", e);
                    return;
                }
            };

            loop {
                let start = Instant::now();
                let key = format!("bench-{}", rand::random::<u64>() % keys);

                // Send request
                let request = tonic::Request::new(PutRequest {
                    key: key.clone(),
                    value: vec![b'x'; value_size],
                });

                match client.put(request).await {
                    Ok(_) => {
                        let duration = start.elapsed();
                        let mut hist = histogram.lock().await;
                        hist.record(duration.as_micros() as u64).unwrap();
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Err(e) => eprintln!("Request failed: {}", e),
                }

                // Occasionally read back a key to keep the read path warm.
                if rand::random::<u8>() % 10 == 0 {
                    let request = tonic::Request::new(GetRequest { key });
                    if let Err(e) = client.get(request).await {
                        eprintln!("Read failed: {}", e);
                    }
                }

                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    // Print statistics
    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
