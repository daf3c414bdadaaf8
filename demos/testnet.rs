//! Run a local testnet, store a value from one node and read it from another.
//!
//! Run: `cargo run --example testnet -- --nodes 50`

use std::time::Instant;

use clap::Parser;
use distdb::{Dht, GetOptions, PutOptions, Testnet};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes of the testnet
    #[arg(long, default_value_t = 20)]
    nodes: usize,
    /// Key to store
    #[arg(long, default_value = "hello")]
    key: String,
    /// Value to store
    #[arg(long, default_value = "world")]
    value: String,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let start = Instant::now();
    let testnet = Testnet::new(cli.nodes).unwrap();
    println!("Booted {} nodes in {:?}", cli.nodes, start.elapsed());

    let writer = Dht::builder().testnet(&testnet).build().unwrap();
    let reader = Dht::builder().testnet(&testnet).build().unwrap();
    writer.integrate(true).unwrap();
    reader.integrate(true).unwrap();

    let start = Instant::now();
    let key = writer
        .put(cli.key.as_bytes(), cli.value.clone(), PutOptions::default())
        .unwrap();
    println!("Stored {key} in {:?}", start.elapsed());

    let start = Instant::now();
    for value in reader.get(cli.key.as_bytes(), GetOptions::default()).unwrap() {
        println!(
            "Got {:?} (version {}) after {:?}",
            String::from_utf8_lossy(value.payload()),
            value.version(),
            start.elapsed()
        );
    }

    println!("{:?}", reader.info().unwrap());
}
