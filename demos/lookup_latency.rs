//! Single-operation latency on a local testnet.
//!
//! Measures wall-clock time of lookups and puts from different nodes.
//!
//! Run: `cargo run --release --example lookup_latency -- --nodes 100`

use std::time::{Duration, Instant};

use clap::Parser;
use distdb::{Id, PutOptions, Testnet};
use histo::Histogram;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 100)]
    nodes: usize,
    #[arg(long, default_value_t = 30)]
    samples: usize,
}

fn main() {
    let cli = Cli::parse();

    println!("latency\n");

    let testnet = Testnet::new(cli.nodes).unwrap();
    let nodes = &testnet.nodes;
    let size = nodes.len();

    let mut timings = Vec::with_capacity(cli.samples);

    for i in 0..cli.samples {
        let node_idx = (i % (size - 1)) + 1;
        let start = Instant::now();
        let _ = nodes[node_idx].lookup(Id::random());
        timings.push(start.elapsed());
    }

    println!("lookup ({size} nodes, {} samples)", cli.samples);
    print_stats(&timings);

    let mut timings = Vec::with_capacity(cli.samples);

    for i in 0..cli.samples {
        let key = format!("lookup_latency_put_{i}");
        let node_idx = (i % (size - 1)) + 1;
        let start = Instant::now();
        let _ = nodes[node_idx].put(key.as_bytes(), "value", PutOptions::default());
        timings.push(start.elapsed());
    }

    println!("put ({size} nodes, {} samples)", cli.samples);
    print_stats(&timings);
}

fn print_stats(timings: &[Duration]) {
    let mut histogram = Histogram::with_buckets(10);
    for timing in timings {
        histogram.add(timing.as_millis() as u64);
    }

    let mut ms: Vec<f64> = timings.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    ms.sort_by(|a, b| a.total_cmp(b));
    let n = ms.len();
    let mean: f64 = ms.iter().sum::<f64>() / n as f64;

    println!(
        "  min={:.1}ms  mean={:.1}ms  p50={:.1}ms  p95={:.1}ms  max={:.1}ms\n",
        ms[0],
        mean,
        ms[n / 2],
        ms[n * 95 / 100],
        ms[n - 1],
    );
    println!("{histogram}");
}
