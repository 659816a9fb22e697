use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ini::Ini;

/// Server configuration, loaded from `config.txt` (INI) in the configured
/// config directory. Every field has a documented default so a fresh
/// config directory with no file at all still runs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub loglevel: String,
    pub logfile: Option<PathBuf>,
    pub daemonize: bool,
    pub daemondir: PathBuf,
    pub pidfile: PathBuf,

    pub userdir: PathBuf,
    pub uploaddir: PathBuf,
    pub msgdir: PathBuf,
    pub keyfile: PathBuf,
    pub certfile: PathBuf,
    pub dbfile: PathBuf,

    pub recv_timeout: Duration,
    pub accept_timeout: Duration,

    pub server_address: String,
    pub server_port: u16,

    pub fileserver_enabled: bool,
    pub fileserver_port: u16,
    pub fileserver_max_filesize: u64,
    pub fileserver_delete_files: bool,

    pub audioserver_enabled: bool,
    pub audioserver_port: u16,
}

impl ServerConfig {
    /// Defaults rooted at `base_dir`, before any `config.txt` is applied.
    pub fn defaults(base_dir: &Path) -> Self {
        Self {
            loglevel: "info".into(),
            logfile: None,
            daemonize: false,
            daemondir: base_dir.to_path_buf(),
            pidfile: PathBuf::from("/run/retro_server.pid"),

            userdir: base_dir.join("users"),
            uploaddir: base_dir.join("uploads"),
            msgdir: base_dir.join("msg"),
            keyfile: base_dir.join("certs/key.pem"),
            certfile: base_dir.join("certs/cert.pem"),
            dbfile: base_dir.join("server.db"),

            recv_timeout: Duration::from_secs(10),
            accept_timeout: Duration::from_secs(3),

            server_address: "0.0.0.0".into(),
            server_port: 8443,

            fileserver_enabled: false,
            fileserver_port: 8444,
            fileserver_max_filesize: 0x4000_0000,
            fileserver_delete_files: true,

            audioserver_enabled: false,
            audioserver_port: 8445,
        }
    }

    /// Load `config.txt` from `config_dir`, applying it over the
    /// directory-relative defaults. Missing sections or keys fall back to
    /// their default; a present but unparsable value is an error.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let mut cfg = Self::defaults(config_dir);
        let path = config_dir.join("config.txt");
        if !path.exists() {
            return Ok(cfg);
        }

        let ini = Ini::load_from_file(&path)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        if let Some(section) = ini.section(Some("default")) {
            if let Some(v) = section.get("loglevel") {
                cfg.loglevel = v.to_string();
            }
            if let Some(v) = section.get("logfile") {
                cfg.logfile = Some(PathBuf::from(v));
            }
            if let Some(v) = section.get("daemonize") {
                cfg.daemonize = parse_bool(v)?;
            }
            if let Some(v) = section.get("daemondir") {
                cfg.daemondir = PathBuf::from(v);
            }
            if let Some(v) = section.get("pidfile") {
                cfg.pidfile = PathBuf::from(v);
            }
            if let Some(v) = section.get("userdir") {
                cfg.userdir = PathBuf::from(v);
            }
            if let Some(v) = section.get("uploaddir") {
                cfg.uploaddir = PathBuf::from(v);
            }
            if let Some(v) = section.get("msgdir") {
                cfg.msgdir = PathBuf::from(v);
            }
            if let Some(v) = section.get("keyfile") {
                cfg.keyfile = PathBuf::from(v);
            }
            if let Some(v) = section.get("certfile") {
                cfg.certfile = PathBuf::from(v);
            }
            if let Some(v) = section.get("recv_timeout") {
                cfg.recv_timeout = Duration::from_secs(parse_u64(v)?);
            }
            if let Some(v) = section.get("accept_timeout") {
                cfg.accept_timeout = Duration::from_secs(parse_u64(v)?);
            }
        }

        if let Some(section) = ini.section(Some("server")) {
            if let Some(v) = section.get("address") {
                cfg.server_address = v.to_string();
            }
            if let Some(v) = section.get("port") {
                cfg.server_port = parse_u64(v)? as u16;
            }
        }

        if let Some(section) = ini.section(Some("fileserver")) {
            if let Some(v) = section.get("enabled") {
                cfg.fileserver_enabled = parse_bool(v)?;
            }
            if let Some(v) = section.get("port") {
                cfg.fileserver_port = parse_u64(v)? as u16;
            }
            if let Some(v) = section.get("max_filesize") {
                cfg.fileserver_max_filesize = parse_u64(v)?;
            }
            if let Some(v) = section.get("delete_files") {
                cfg.fileserver_delete_files = parse_bool(v)?;
            }
        }

        if let Some(section) = ini.section(Some("audioserver")) {
            if let Some(v) = section.get("enabled") {
                cfg.audioserver_enabled = parse_bool(v)?;
            }
            if let Some(v) = section.get("port") {
                cfg.audioserver_port = parse_u64(v)? as u16;
            }
        }

        Ok(cfg)
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid boolean value: {other}"),
    }
}

fn parse_u64(v: &str) -> Result<u64> {
    let v = v.trim();
    if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).with_context(|| format!("invalid hex integer: {v}"))
    } else {
        v.parse::<u64>()
            .with_context(|| format!("invalid integer: {v}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_spec() {
        let cfg = ServerConfig::defaults(Path::new("/base"));
        assert_eq!(cfg.loglevel, "info");
        assert_eq!(cfg.recv_timeout, Duration::from_secs(10));
        assert_eq!(cfg.accept_timeout, Duration::from_secs(3));
        assert_eq!(cfg.server_address, "0.0.0.0");
        assert_eq!(cfg.server_port, 8443);
        assert!(!cfg.fileserver_enabled);
        assert_eq!(cfg.fileserver_port, 8444);
        assert_eq!(cfg.fileserver_max_filesize, 0x4000_0000);
        assert!(cfg.fileserver_delete_files);
        assert!(!cfg.audioserver_enabled);
        assert_eq!(cfg.audioserver_port, 8445);
        assert_eq!(cfg.userdir, Path::new("/base/users"));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.server_port, 8443);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("config.txt")).unwrap();
        writeln!(
            f,
            "[default]\nloglevel = debug\nrecv_timeout = 30\n\n[server]\nport = 9000\n\n[fileserver]\nenabled = true\nmax_filesize = 0x1000\n"
        )
        .unwrap();
        drop(f);

        let cfg = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.loglevel, "debug");
        assert_eq!(cfg.recv_timeout, Duration::from_secs(30));
        assert_eq!(cfg.server_port, 9000);
        assert!(cfg.fileserver_enabled);
        assert_eq!(cfg.fileserver_max_filesize, 0x1000);
    }

    #[test]
    fn parse_bool_rejects_garbage() {
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn parse_u64_accepts_hex_and_decimal() {
        assert_eq!(parse_u64("0x10").unwrap(), 16);
        assert_eq!(parse_u64("16").unwrap(), 16);
    }
}
