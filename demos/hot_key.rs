//! Many writers publishing under one key until the nodes storing it
//! diversify, then read it back through the derived keys.
//!
//! Run: `cargo run --example hot_key -- --writers 80`

use clap::Parser;
use distdb::{Dht, GetOptions, PutOptions, Testnet, ValueFlags, MAX_VALUE_SIZE};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value_t = 20)]
    nodes: usize,
    /// Distinct nodes writing a full sized value under the same key
    #[arg(long, default_value_t = 80)]
    writers: usize,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();
    let key = b"hot key";

    let testnet = Testnet::new(cli.nodes).unwrap();

    let options = PutOptions {
        flags: ValueFlags::MULTI_VALUE,
        ..Default::default()
    };

    for i in 0..cli.writers {
        let writer = Dht::builder().testnet(&testnet).build().unwrap();
        writer.integrate(true).unwrap();

        let mut payload = vec![0; MAX_VALUE_SIZE];
        payload[..8].copy_from_slice(&(i as u64).to_be_bytes());

        match writer.put(key, payload, options) {
            Ok(_) => {}
            Err(error) => println!("writer {i}: {error}"),
        }

        if writer.is_diversified(key).unwrap() {
            println!("Key diversified after {} writers", i + 1);
        }
    }

    let reader = Dht::builder().testnet(&testnet).build().unwrap();
    reader.integrate(true).unwrap();

    let found = reader
        .get(
            key,
            GetOptions {
                flags: ValueFlags::MULTI_VALUE,
                exhaustive: true,
                ..Default::default()
            },
        )
        .unwrap()
        .count();

    println!(
        "Read {found} values, diversified: {}",
        reader.is_diversified(key).unwrap()
    );
}
