//! Utility functions for loading the proxy source.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::ProxyLoadError;
use crate::proxy::ProxyRecord;

fn to_err(path: &Path) -> impl FnOnce(io::Error) -> ProxyLoadError {
    let path = path.to_path_buf();
    move |source| ProxyLoadError { path, source }
}

/// Read every `.txt` file in `dir` and parse the proxies it lists.
pub(crate) fn load_proxies_from_dir(dir: &Path) -> Result<Vec<ProxyRecord>, ProxyLoadError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(to_err(dir))? {
        let path = entry.map_err(to_err(dir))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "txt") {
            files.push(path);
        }
    }
    // read_dir order is platform dependent
    files.sort();

    let mut records = Vec::new();
    for path in files {
        let content = fs::read_to_string(&path).map_err(to_err(&path))?;
        records.extend(parse_proxy_list(&content));
    }
    Ok(records)
}

/// Parse `address:port:username:password` lines. Lines with any other field
/// count are skipped; empty credentials are allowed.
pub(crate) fn parse_proxy_list(content: &str) -> Vec<ProxyRecord> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let parts: Vec<&str> = line.split(':').map(str::trim).collect();
            match parts.as_slice() {
                [address, port, username, password] => Some(ProxyRecord::new(
                    *address,
                    *port,
                    Some(username.to_string()),
                    Some(password.to_string()),
                )),
                _ => None,
            }
        })
        .collect()
}
