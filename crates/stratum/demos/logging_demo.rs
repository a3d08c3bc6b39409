//! Shows the tracing output of the storage layers.
//!
//! Run with: RUST_LOG=debug cargo run -p stratum --example logging_demo

use stratum::logging::{LogConfig, LogFormat};
use stratum::{BTreeConfig, Database, DatabaseConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = LogConfig::debug().with_format(LogFormat::Compact).init()?;

    println!("=== Stratum Logging Demo ===\n");

    // Small nodes so a handful of inserts already splits
    let config = DatabaseConfig::default().with_btree(BTreeConfig::default().with_max_keys(4));
    let db = Database::in_memory_with_config(config)?;

    println!("\n1. Inserting data...");
    for i in 0..12u32 {
        db.put(format!("user:{:02}", i).as_bytes(), b"payload")?;
    }

    println!("\n2. Deleting data...");
    for i in 0..6u32 {
        db.delete(format!("user:{:02}", i).as_bytes())?;
    }

    println!("\n3. Rolling back a batch...");
    db.begin()?;
    db.put(b"user:99", b"discarded")?;
    db.rollback()?;

    println!("\n4. Verifying...");
    let stats = db.verify()?;
    println!("{} entries, {} handles", db.len()?, stats.handles);

    println!("\n=== Demo Complete ===");
    Ok(())
}
