//! Micro-benchmarks for RoutingTable operations: note contacts, closest, and
//! failures at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use distdb::{Contact, Id, RoutingTable};
use std::time::Instant;

fn main() {
    println!("routing_table\n");

    bench_note_contact();
    bench_find_closest();
    bench_note_failure();
}

fn contacts(n: usize) -> Vec<Contact> {
    (1..=n).map(Contact::unique).collect()
}

fn bench_note_contact() {
    println!("note_contact");

    // Pre-generate contacts outside the timed section
    let fresh = contacts(1000);

    // Empty table
    {
        let mut table = RoutingTable::new(Id::random());
        let start = Instant::now();
        for contact in fresh.iter().cloned() {
            table.note_contact(contact, true);
        }
        let per_op = start.elapsed().as_nanos() / fresh.len() as u128;
        println!(
            "empty table:  {per_op}ns/op (final size: {}, replacements: {})",
            table.size(),
            table.replacements_count()
        );
    }

    // Refreshing contacts already in the table
    {
        let mut table = RoutingTable::new(Id::random());
        for contact in fresh.iter().cloned() {
            table.note_contact(contact, true);
        }

        let start = Instant::now();
        for contact in fresh.iter().cloned() {
            table.note_contact(contact, true);
        }
        let per_op = start.elapsed().as_nanos() / fresh.len() as u128;
        println!("refresh:      {per_op}ns/op");
    }

    println!();
}

fn bench_find_closest() {
    println!("find_closest");

    let targets: Vec<_> = (0..1000).map(|_| Id::random()).collect();

    for size in [50, 100, 200, 400] {
        let mut table = RoutingTable::new(Id::random());
        for contact in contacts(size) {
            table.note_contact(contact, true);
        }

        let start = Instant::now();
        for target in &targets {
            let _ = table.find_closest(target, 20);
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>3} contacts: {per_op}ns/op");
    }

    println!();
}

fn bench_note_failure() {
    println!("note_failure");

    let mut table = RoutingTable::new(Id::random());
    for contact in contacts(400) {
        table.note_contact(contact, true);
    }

    let ids: Vec<Id> = table.contacts().map(|contact| *contact.id()).collect();

    let n = ids.len();
    let start = Instant::now();
    for id in &ids {
        table.note_failure(id);
    }
    let per_op = start.elapsed().as_nanos() / n as u128;
    println!("{per_op}ns/op ({n} failures, {} left)", table.size());
    println!();
}
