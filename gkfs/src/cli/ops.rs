use anyhow::{Context, Result, bail};
use comfy_table::{Table, presets::UTF8_FULL};
use gkfs::client::Client;
use gkfs::config::Settings;
use gkfs::error::FsError;
use gkfs::metadata::Metadata;
use num_format::{Locale, ToFormattedString};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const FILE_MODE: u32 = libc::S_IFREG | 0o644;
const DIR_MODE: u32 = libc::S_IFDIR | 0o755;

async fn connect_client(config_path: &Path) -> Result<Client> {
    let settings = Settings::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let client = Client::connect(&settings)?;
    client
        .verify_cluster()
        .await
        .context("Daemons are unreachable or disagree with the client configuration")?;
    Ok(client)
}

pub async fn write_file(
    config_path: &Path,
    path: &str,
    input: Option<&Path>,
    offset: u64,
    append: bool,
) -> Result<()> {
    let client = connect_client(config_path).await?;
    let data = match input {
        Some(input) => tokio::fs::read(input)
            .await
            .with_context(|| format!("Failed to read {}", input.display()))?,
        None => {
            let mut data = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut data)
                .await
                .context("Failed to read stdin")?;
            data
        }
    };

    match client.create(path, FILE_MODE).await {
        Ok(()) | Err(FsError::Exists) => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to create {}", path)),
    }

    let outcome = client.write(path, &data, offset, append).await;
    let written = outcome.into_result().with_context(|| {
        format!(
            "Write to {} failed after {} of {} bytes",
            path,
            outcome.io_size,
            data.len()
        )
    })?;
    println!(
        "✓ Wrote {} bytes to {} at offset {}",
        written.to_formatted_string(&Locale::en),
        path,
        outcome.offset
    );
    Ok(())
}

pub async fn read_file(
    config_path: &Path,
    path: &str,
    output: Option<&Path>,
    offset: u64,
    length: Option<u64>,
) -> Result<()> {
    let client = connect_client(config_path).await?;
    let length = match length {
        Some(length) => length,
        None => {
            let size = client
                .get_size(path)
                .await
                .with_context(|| format!("Failed to stat {}", path))?;
            size.saturating_sub(offset)
        }
    };
    let mut buf = vec![0u8; usize::try_from(length).context("Read length too large")?];
    let outcome = client.read(path, &mut buf, offset).await;
    outcome
        .into_result()
        .with_context(|| format!("Read of {} failed after {} bytes", path, outcome.io_size))?;

    match output {
        Some(output) => {
            tokio::fs::write(output, &buf)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "✓ Read {} bytes from {} into {}",
                buf.len().to_formatted_string(&Locale::en),
                path,
                output.display()
            );
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&buf).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

pub async fn stat(config_path: &Path, path: &str) -> Result<()> {
    let client = connect_client(config_path).await?;
    let md = client
        .stat(path)
        .await
        .with_context(|| format!("Failed to stat {}", path))?;

    println!("Path: {}", path);
    println!("  Type: {}", file_type(&md));
    println!("  Mode: {:o}", md.mode & 0o7777);
    println!("  Size: {}", md.size.to_formatted_string(&Locale::en));
    println!("  Links: {}", md.link_count);
    println!("  Blocks: {}", md.blocks);
    println!("  Access: {}", format_timestamp(md.atime));
    println!("  Modify: {}", format_timestamp(md.mtime));
    println!("  Change: {}", format_timestamp(md.ctime));
    Ok(())
}

pub async fn list(config_path: &Path, path: &str, long: bool) -> Result<()> {
    let client = connect_client(config_path).await?;
    if !long {
        let entries = client
            .get_dirents(path)
            .await
            .with_context(|| format!("Failed to list {}", path))?;
        for entry in entries {
            println!("{}{}", entry.name, if entry.is_dir { "/" } else { "" });
        }
        return Ok(());
    }

    let entries = client
        .get_dirents_extended(path)
        .await
        .with_context(|| format!("Failed to list {}", path))?;
    if entries.is_empty() {
        println!("{} is empty.", path);
        return Ok(());
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Name", "Type", "Size", "Changed"]);
    for entry in entries {
        table.add_row(vec![
            entry.name,
            if entry.is_dir { "dir" } else { "file" }.to_string(),
            entry.size.to_formatted_string(&Locale::en),
            format_timestamp(entry.ctime),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn mkdir(config_path: &Path, path: &str) -> Result<()> {
    let client = connect_client(config_path).await?;
    client
        .create(path, DIR_MODE)
        .await
        .with_context(|| format!("Failed to create directory {}", path))?;
    println!("✓ Created directory {}", path);
    Ok(())
}

pub async fn remove(config_path: &Path, path: &str) -> Result<()> {
    let client = connect_client(config_path).await?;
    let removed = client
        .remove(path)
        .await
        .with_context(|| format!("Failed to remove {}", path))?;
    println!(
        "✓ Removed {} ({} bytes)",
        path,
        removed.size.to_formatted_string(&Locale::en)
    );
    Ok(())
}

pub async fn truncate(config_path: &Path, path: &str, size: u64) -> Result<()> {
    let client = connect_client(config_path).await?;
    let current = client
        .get_size(path)
        .await
        .with_context(|| format!("Failed to stat {}", path))?;
    if size > current {
        bail!(
            "Cannot grow {} from {} to {} bytes by truncation",
            path,
            current,
            size
        );
    }
    client
        .truncate(path, size)
        .await
        .with_context(|| format!("Failed to truncate {}", path))?;
    println!("✓ Truncated {} to {} bytes", path, size);
    Ok(())
}

pub async fn df(config_path: &Path) -> Result<()> {
    let client = connect_client(config_path).await?;
    let stat = client
        .chunk_stat()
        .await
        .context("Failed to collect storage statistics")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Hosts", "Chunk Size", "Total Chunks", "Free Chunks", "Used"]);
    let used_pct = if stat.chunk_total > 0 {
        (stat.chunk_total - stat.chunk_free.min(stat.chunk_total)) as f64 * 100.0
            / stat.chunk_total as f64
    } else {
        0.0
    };
    table.add_row(vec![
        client.hosts_size().to_string(),
        stat.chunk_size.to_formatted_string(&Locale::en),
        stat.chunk_total.to_formatted_string(&Locale::en),
        stat.chunk_free.to_formatted_string(&Locale::en),
        format!("{used_pct:.1}%"),
    ]);
    println!("{table}");
    Ok(())
}

pub async fn stats(config_path: &Path, host: Option<u64>) -> Result<()> {
    let client = connect_client(config_path).await?;
    let hosts: Vec<u64> = match host {
        Some(host) => vec![host],
        None => (0..client.hosts_size()).collect(),
    };
    for host in hosts {
        let report = client
            .daemon_stats(host)
            .await
            .with_context(|| format!("Failed to fetch statistics of host {}", host))?;
        println!("Host {}:\n{}", host, report);
    }
    Ok(())
}

fn file_type(md: &Metadata) -> &'static str {
    if md.is_dir() {
        "directory"
    } else if md.is_regular() {
        "regular file"
    } else {
        "other"
    }
}

fn format_timestamp(timestamp: u64) -> String {
    use std::time::{Duration, UNIX_EPOCH};

    let time = UNIX_EPOCH + Duration::from_secs(timestamp);
    let datetime: chrono::DateTime<chrono::Local> = time.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}
