//! Writes to a database, closes it, reopens it and checks what survived.
//!
//! Run with: cargo run -p stratum --example persistent_demo

use std::path::Path;
use stratum::Database;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let db_path = "./demo_database";

    println!("=== Stratum Persistent Database Demo ===\n");

    if Path::new(db_path).exists() {
        std::fs::remove_dir_all(db_path)?;
        println!("Cleaned up previous demo data\n");
    }

    println!("PART 1: Writing data");
    {
        let db = Database::open(db_path)?;
        db.put(b"user:1:name", b"Alice")?;
        db.put(b"user:1:email", b"alice@example.com")?;
        db.put(b"user:2:name", b"Bob")?;
        db.put(b"user:2:email", b"bob@example.com")?;
        db.put(b"stats:total_users", b"2")?;
        println!("   Stored {} entries in {}\n", db.len()?, db_path);
    }

    println!("PART 2: A batch that never commits");
    {
        let db = Database::open(db_path)?;
        db.begin()?;
        db.put(b"user:3:name", b"Mallory")?;
        db.put(b"stats:total_users", b"3")?;
        println!("   Dropping the database with the batch still open\n");
    }

    println!("PART 3: Reopening");
    {
        let db = Database::open(db_path)?;
        let recovery = db.recovery_stats()?;
        println!(
            "   Rolled back: {} ({} pages restored)",
            recovery.rolled_back, recovery.records_applied
        );

        for (key, value) in db.scan(b"user:", 10)? {
            println!(
                "   {} = {}",
                String::from_utf8_lossy(&key),
                String::from_utf8_lossy(&value)
            );
        }
        let total = db.get(b"stats:total_users")?.unwrap_or_default();
        println!("   total users: {}", String::from_utf8_lossy(&total));

        let stats = db.verify()?;
        println!(
            "\n   Verified: {} used chunks, {} free chunks, {:.1}% free",
            stats.used_chunks,
            stats.free_chunks,
            stats.free_ratio() * 100.0
        );
    }

    std::fs::remove_dir_all(db_path)?;
    println!("\n=== Demo Complete ===");
    Ok(())
}
