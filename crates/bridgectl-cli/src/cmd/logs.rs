use anyhow::Context;
use bridgectl_core::{io, paths};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;

const FOLLOW_POLL: Duration = Duration::from_millis(500);

pub fn run(root: &Path, lines: usize, error: bool, follow: bool) -> anyhow::Result<()> {
    let path = if error {
        paths::bridge_error_log_path(root)
    } else {
        paths::bridge_log_path(root)
    };

    if !path.exists() && !follow {
        println!("No log yet at {}.", path.display());
        return Ok(());
    }
    for line in io::tail_lines(&path, lines)? {
        println!("{line}");
    }
    if follow {
        follow_file(&path)?;
    }
    Ok(())
}

/// Print bytes appended to `path` until interrupted. Truncation (log
/// rotation) restarts from the beginning of the file.
fn follow_file(path: &Path) -> anyhow::Result<()> {
    let mut pos = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mut stdout = std::io::stdout();
    let mut buf = Vec::new();
    loop {
        std::thread::sleep(FOLLOW_POLL);
        let Ok(mut file) = std::fs::File::open(path) else {
            continue;
        };
        let len = file.metadata()?.len();
        if len < pos {
            pos = 0;
        }
        if len == pos {
            continue;
        }
        file.seek(SeekFrom::Start(pos))?;
        buf.clear();
        file.read_to_end(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        pos += buf.len() as u64;
        stdout.write_all(&buf)?;
        stdout.flush()?;
    }
}
