use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use num_format::{Locale, ToFormattedString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const MB_IN_BYTES: f64 = 1_048_576.0;

struct PreviousSnapshot {
    total_operations: u64,
    bytes_read: u64,
    bytes_written: u64,
    timestamp: Instant,
}

pub struct DaemonStats {
    // Data requests
    pub write_requests: AtomicU64,
    pub read_requests: AtomicU64,
    pub truncate_requests: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub chunk_writes: AtomicU64,
    pub chunk_reads: AtomicU64,
    pub chunk_errors: AtomicU64,

    // Metadata requests
    pub creates: AtomicU64,
    pub stats: AtomicU64,
    pub removes: AtomicU64,
    pub size_updates: AtomicU64,
    pub dirent_listings: AtomicU64,

    pub failed_requests: AtomicU64,
    pub in_flight: AtomicU64,
    pub total_operations: AtomicU64,

    last_snapshot: std::sync::Mutex<PreviousSnapshot>,
}

impl Default for DaemonStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonStats {
    pub fn new() -> Self {
        Self {
            write_requests: AtomicU64::new(0),
            read_requests: AtomicU64::new(0),
            truncate_requests: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            chunk_writes: AtomicU64::new(0),
            chunk_reads: AtomicU64::new(0),
            chunk_errors: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            stats: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            size_updates: AtomicU64::new(0),
            dirent_listings: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            total_operations: AtomicU64::new(0),
            last_snapshot: std::sync::Mutex::new(PreviousSnapshot {
                total_operations: 0,
                bytes_read: 0,
                bytes_written: 0,
                timestamp: Instant::now(),
            }),
        }
    }

    pub fn count(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> String {
        let write_requests = self.write_requests.load(Ordering::Relaxed);
        let read_requests = self.read_requests.load(Ordering::Relaxed);
        let truncate_requests = self.truncate_requests.load(Ordering::Relaxed);
        let bytes_read = self.bytes_read.load(Ordering::Relaxed);
        let bytes_written = self.bytes_written.load(Ordering::Relaxed);
        let chunk_writes = self.chunk_writes.load(Ordering::Relaxed);
        let chunk_reads = self.chunk_reads.load(Ordering::Relaxed);
        let chunk_errors = self.chunk_errors.load(Ordering::Relaxed);

        let creates = self.creates.load(Ordering::Relaxed);
        let stats = self.stats.load(Ordering::Relaxed);
        let removes = self.removes.load(Ordering::Relaxed);
        let size_updates = self.size_updates.load(Ordering::Relaxed);
        let dirent_listings = self.dirent_listings.load(Ordering::Relaxed);

        let failed = self.failed_requests.load(Ordering::Relaxed);
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        let total_ops = self.total_operations.load(Ordering::Relaxed);

        // a poisoned lock only means a previous report panicked midway
        let mut snapshot = self
            .last_snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let interval_secs = snapshot.timestamp.elapsed().as_secs_f64();
        let rate = |now: u64, before: u64| {
            if interval_secs > 0.0 {
                now.saturating_sub(before) as f64 / interval_secs
            } else {
                0.0
            }
        };
        let ops_per_sec = rate(total_ops, snapshot.total_operations);
        let mb_read_per_sec = rate(bytes_read, snapshot.bytes_read) / MB_IN_BYTES;
        let mb_written_per_sec = rate(bytes_written, snapshot.bytes_written) / MB_IN_BYTES;

        *snapshot = PreviousSnapshot {
            total_operations: total_ops,
            bytes_read,
            bytes_written,
            timestamp: Instant::now(),
        };

        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("gkfs Daemon Statistics")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new("Value")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
        ]);

        table.add_row(vec![
            Cell::new("Data Requests (total)")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
            Cell::new(""),
        ]);
        table.add_row(vec![
            Cell::new("  Requests"),
            Cell::new(format!(
                "Write: {} | Read: {} | Truncate: {}",
                write_requests.to_formatted_string(&Locale::en),
                read_requests.to_formatted_string(&Locale::en),
                truncate_requests.to_formatted_string(&Locale::en)
            )),
        ]);
        table.add_row(vec![
            Cell::new("  Chunks"),
            Cell::new(format!(
                "Written: {} | Read: {} | Failed: {}",
                chunk_writes.to_formatted_string(&Locale::en),
                chunk_reads.to_formatted_string(&Locale::en),
                chunk_errors.to_formatted_string(&Locale::en)
            )),
        ]);
        table.add_row(vec![
            Cell::new("  Bytes"),
            Cell::new(format!(
                "Written: {} | Read: {}",
                bytes_written.to_formatted_string(&Locale::en),
                bytes_read.to_formatted_string(&Locale::en)
            )),
        ]);

        table.add_row(vec![
            Cell::new("Metadata Requests (total)")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
            Cell::new(""),
        ]);
        table.add_row(vec![
            Cell::new("  Entries"),
            Cell::new(format!(
                "Created: {} | Stat: {} | Removed: {}",
                creates.to_formatted_string(&Locale::en),
                stats.to_formatted_string(&Locale::en),
                removes.to_formatted_string(&Locale::en)
            )),
        ]);
        table.add_row(vec![
            Cell::new("  Sizes / Listings"),
            Cell::new(format!(
                "{} size updates, {} listings",
                size_updates.to_formatted_string(&Locale::en),
                dirent_listings.to_formatted_string(&Locale::en)
            )),
        ]);

        table.add_row(vec![
            Cell::new("Throughput (per second)")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
            Cell::new(""),
        ]);
        table.add_row(vec![
            Cell::new("  Read"),
            Cell::new(format!("{mb_read_per_sec:.2} MB/s")).fg(Color::Green),
        ]);
        table.add_row(vec![
            Cell::new("  Write"),
            Cell::new(format!("{mb_written_per_sec:.2} MB/s")).fg(Color::Blue),
        ]);
        table.add_row(vec![
            Cell::new("  All Operations"),
            Cell::new(format!("{ops_per_sec:.1} ops/s"))
                .fg(Color::Magenta)
                .add_attribute(Attribute::Bold),
        ]);
        table.add_row(vec![
            Cell::new("  Failed / In flight"),
            Cell::new(format!(
                "{} / {}",
                failed.to_formatted_string(&Locale::en),
                in_flight.to_formatted_string(&Locale::en)
            ))
            .fg(Color::Red),
        ]);

        table.to_string()
    }

    pub fn output_report_debug(&self) {
        tracing::debug!("\n{}", self.report());
    }
}
