//! `.env` loading: `KEY=value` lines, optional `export`, quotes and `#` comments.
//! Values already present in the process environment always win.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    /// Named on the command line rather than picked up from the working directory.
    pub explicit: bool,
}

/// Load `explicit` if given (it must exist), otherwise `./.env` when present.
pub fn load(explicit: Option<PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        apply(&path)?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let path = cwd.join(".env");
    if !path.is_file() {
        return Ok(None);
    }
    apply(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit: false }))
}

fn apply(path: &Path) -> Result<(), String> {
    let contents = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (key, value) in parse(&contents).map_err(|e| format!("{}:{}", path.display(), e))? {
        if std::env::var_os(&key).is_none() {
            // Mutating the process environment is unsafe on some targets; this
            // runs before any other thread exists.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parse a whole file into assignments, in file order. Errors carry the line number.
pub fn parse(contents: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(pair)) => out.push(pair),
            Ok(None) => {}
            Err(e) => return Err(format!("{}: {}", index + 1, e)),
        }
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, raw) = line.split_once('=').ok_or("missing '=' in assignment")?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let raw = raw.trim();
    let value = if let Some(rest) = raw.strip_prefix('"') {
        quoted(rest, '"', true)?
    } else if let Some(rest) = raw.strip_prefix('\'') {
        quoted(rest, '\'', false)?
    } else {
        raw.split('#').next().unwrap_or_default().trim_end().to_string()
    };
    Ok(Some((key.to_string(), value)))
}

fn quoted(input: &str, quote: char, escapes: bool) -> Result<String, String> {
    let mut value = String::new();
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if escapes && ch == '\\' {
            let escaped = chars.next().ok_or("unterminated escape sequence")?;
            value.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
        } else if ch == quote {
            let rest = chars.as_str().trim();
            return if rest.is_empty() || rest.starts_with('#') {
                Ok(value)
            } else {
                Err(format!("unexpected characters after closing {} quote", quote))
            };
        } else {
            value.push(ch);
        }
    }
    Err(format!("unterminated {} quoted value", quote))
}
