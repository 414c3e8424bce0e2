//! Server configuration loader.
//!
//! Reads `mcp-servers.json` (or `.yaml`), expands `${VAR}` /
//! `${VAR:-default}` references in every string value, and validates each
//! entry into a [`ServerDescriptor`]. Streamed-HTTP URLs pointing at
//! loopback, private or link-local addresses are refused unless the entry
//! sets `allowPrivateNetwork`.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;
use super::types::{ServerDescriptor, TransportConfig};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TOOLMUX_CONFIG";

/// File names searched for when walking up from the working directory.
const CONFIG_FILE_NAMES: &[&str] = &["mcp-servers.json", "mcp-servers.yaml", "mcp-servers.yml"];

// ─── Raw Config ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(alias = "mcpServers", default)]
    servers: BTreeMap<String, RawServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServer {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default, alias = "allow_private_network")]
    allow_private_network: bool,
    /// Idle call timeout in milliseconds.
    timeout: Option<u64>,
    /// Total call cap in milliseconds.
    #[serde(alias = "max_total_timeout")]
    max_total_timeout: Option<u64>,
    #[serde(default)]
    disabled: bool,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Find the server configuration file.
///
/// Search order:
/// 1. `TOOLMUX_CONFIG` environment variable
/// 2. Walk up from `start` looking for `mcp-servers.{json,yaml,yml}`
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    locate_config(std::env::var(CONFIG_ENV).ok(), start)
}

fn locate_config(explicit: Option<String>, start: &Path) -> Result<PathBuf, McpError> {
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(McpError::ConfigError {
            reason: format!("{CONFIG_ENV} points to missing file {}", candidate.display()),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find {}", CONFIG_FILE_NAMES.join(" or ")),
    })
}

/// Load and validate a server configuration file.
///
/// YAML is used for `.yaml`/`.yml` files, JSON otherwise.
pub fn load_servers_config(path: &Path) -> Result<Vec<ServerDescriptor>, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    let descriptors = if is_yaml {
        parse_servers_yaml(&raw)?
    } else {
        parse_servers_json(&raw)?
    };
    tracing::info!(
        path = %path.display(),
        servers = descriptors.len(),
        "loaded server configuration"
    );
    Ok(descriptors)
}

pub fn parse_servers_json(content: &str) -> Result<Vec<ServerDescriptor>, McpError> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    descriptors_from_value(value)
}

pub fn parse_servers_yaml(content: &str) -> Result<Vec<ServerDescriptor>, McpError> {
    let value: serde_json::Value =
        serde_yaml::from_str(content).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    descriptors_from_value(value)
}

fn descriptors_from_value(mut value: serde_json::Value) -> Result<Vec<ServerDescriptor>, McpError> {
    interpolate_value(&mut value);
    let file: ServersFile = serde_json::from_value(value).map_err(|e| McpError::ConfigError {
        reason: format!("invalid server configuration: {e}"),
    })?;

    let mut descriptors = Vec::with_capacity(file.servers.len());
    for (name, raw) in file.servers {
        if raw.disabled {
            tracing::debug!(server = %name, "skipping disabled server");
            continue;
        }
        descriptors.push(validate_server(&name, raw)?);
    }
    Ok(descriptors)
}

// ─── Validation ──────────────────────────────────────────────────────────────

fn validate_server(name: &str, raw: RawServer) -> Result<ServerDescriptor, McpError> {
    let invalid = |reason: String| McpError::ConfigError {
        reason: format!("server '{name}': {reason}"),
    };

    if name.trim().is_empty() {
        return Err(McpError::ConfigError {
            reason: "server name must not be empty".into(),
        });
    }

    let wants_http = match raw.kind.as_deref() {
        Some("stdio" | "subprocess") => false,
        Some("http" | "streamable-http" | "streamed-http") => true,
        Some(other) => return Err(invalid(format!("unknown transport type '{other}'"))),
        None => match (&raw.command, &raw.url) {
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (Some(_), Some(_)) => {
                return Err(invalid("set either 'command' or 'url', not both".into()));
            }
            (None, None) => return Err(invalid("missing 'command' or 'url'".into())),
        },
    };

    let transport = if wants_http {
        let url = raw
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| invalid("streamed-http transport requires 'url'".into()))?;
        check_url(&url, raw.allow_private_network).map_err(invalid)?;
        TransportConfig::StreamedHttp {
            url,
            headers: raw.headers,
        }
    } else {
        let command = raw
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| invalid("subprocess transport requires 'command'".into()))?;
        TransportConfig::Subprocess {
            command,
            args: raw.args,
            cwd: raw.cwd,
            env: raw.env,
        }
    };

    Ok(ServerDescriptor {
        name: name.to_string(),
        transport,
        allow_private_network: raw.allow_private_network,
        timeout: raw.timeout.map(Duration::from_millis),
        max_total_timeout: raw.max_total_timeout.map(Duration::from_millis),
    })
}

/// Check the URL scheme and the private-address policy.
fn check_url(url: &str, allow_private_network: bool) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid url '{url}': {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported url scheme '{}'", parsed.scheme()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| format!("url '{url}' has no host"))?;

    if !allow_private_network && is_private_host(host) {
        return Err(format!(
            "url host '{host}' is a private or loopback address (set allowPrivateNetwork to permit)"
        ));
    }
    Ok(())
}

/// Whether `host` names a loopback, private, link-local or otherwise
/// non-public address. Only literal addresses and `localhost` are checked;
/// DNS names are not resolved.
pub fn is_private_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let lower = host.to_ascii_lowercase();
    if lower == "localhost" || lower.ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_v4(ip),
        Ok(IpAddr::V6(ip)) => is_private_v6(ip),
        Err(_) => false,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

// ─── Interpolation ───────────────────────────────────────────────────────────

fn interpolate_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) if s.contains("${") => {
            *s = interpolate_env_vars(s);
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(interpolate_value),
        serde_json::Value::Object(map) => map.values_mut().for_each(interpolate_value),
        _ => {}
    }
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLMUX_TEST_UNSET__");
        assert_eq!(
            interpolate_env_vars("${__TOOLMUX_TEST_UNSET__:-/fallback/path}"),
            "/fallback/path"
        );
        assert_eq!(interpolate_env_vars("a${__TOOLMUX_TEST_UNSET__}b"), "ab");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TOOLMUX_TEST_TOKEN__", "s3cret");
        assert_eq!(
            interpolate_env_vars("Bearer ${__TOOLMUX_TEST_TOKEN__:-none}"),
            "Bearer s3cret"
        );
        std::env::remove_var("__TOOLMUX_TEST_TOKEN__");
    }

    #[test]
    fn test_parse_subprocess_and_http() {
        std::env::set_var("__TOOLMUX_TEST_API_KEY__", "k-123");
        let json = r#"{
            "servers": {
                "fs": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
                    "env": {"API_KEY": "${__TOOLMUX_TEST_API_KEY__}"},
                    "timeout": 5000
                },
                "remote": {
                    "type": "http",
                    "url": "https://tools.example.com/mcp",
                    "headers": {"Authorization": "Bearer ${__TOOLMUX_TEST_API_KEY__}"},
                    "maxTotalTimeout": 120000
                }
            }
        }"#;
        let descriptors = parse_servers_json(json).unwrap();
        std::env::remove_var("__TOOLMUX_TEST_API_KEY__");

        assert_eq!(descriptors.len(), 2);
        let fs = &descriptors[0];
        assert_eq!(fs.name, "fs");
        assert_eq!(fs.timeout, Some(Duration::from_secs(5)));
        match &fs.transport {
            TransportConfig::Subprocess { command, args, env, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 3);
                assert_eq!(env["API_KEY"], "k-123");
            }
            other => panic!("expected subprocess, got {other:?}"),
        }

        let remote = &descriptors[1];
        assert_eq!(remote.max_total_timeout, Some(Duration::from_secs(120)));
        match &remote.transport {
            TransportConfig::StreamedHttp { url, headers } => {
                assert_eq!(url, "https://tools.example.com/mcp");
                assert_eq!(headers["Authorization"], "Bearer k-123");
            }
            other => panic!("expected streamed-http, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_yaml_with_mcp_servers_alias() {
        let yaml = "mcpServers:\n  weather:\n    command: weather-server\n  old:\n    command: legacy\n    disabled: true\n";
        let descriptors = parse_servers_yaml(yaml).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "weather");
    }

    #[test]
    fn test_private_addresses_refused_by_default() {
        for url in [
            "http://localhost:8080/mcp",
            "http://127.0.0.1/mcp",
            "http://10.1.2.3/mcp",
            "http://192.168.1.10/mcp",
            "http://172.20.0.5/mcp",
            "http://169.254.169.254/latest",
            "http://100.64.0.1/mcp",
            "http://[::1]:9000/mcp",
            "http://[fd00::1]/mcp",
            "http://[::ffff:10.0.0.1]/mcp",
        ] {
            let json = format!(r#"{{"servers": {{"local": {{"url": "{url}"}}}}}}"#);
            let err = parse_servers_json(&json).unwrap_err();
            assert!(
                matches!(err, McpError::ConfigError { ref reason } if reason.contains("private")),
                "{url} should be refused, got {err:?}"
            );
        }
    }

    #[test]
    fn test_private_address_allowed_with_override() {
        let json = r#"{"servers": {"local": {
            "url": "http://127.0.0.1:3000/mcp",
            "allowPrivateNetwork": true
        }}}"#;
        let descriptors = parse_servers_json(json).unwrap();
        assert!(descriptors[0].allow_private_network);

        let snake = r#"{"servers": {"local": {
            "url": "http://localhost:3000/mcp",
            "allow_private_network": true
        }}}"#;
        assert!(parse_servers_json(snake).is_ok());
    }

    #[test]
    fn test_public_hosts_pass() {
        assert!(!is_private_host("tools.example.com"));
        assert!(!is_private_host("8.8.8.8"));
        assert!(!is_private_host("[2001:4860:4860::8888]"));
    }

    #[test]
    fn test_invalid_entries() {
        let cases = [
            (r#"{"servers": {"x": {}}}"#, "missing 'command' or 'url'"),
            (
                r#"{"servers": {"x": {"command": "a", "url": "https://e.com"}}}"#,
                "not both",
            ),
            (r#"{"servers": {"x": {"type": "stdio"}}}"#, "requires 'command'"),
            (r#"{"servers": {"x": {"type": "websocket", "url": "wss://e.com"}}}"#, "unknown transport"),
            (r#"{"servers": {"x": {"url": "ftp://files.example.com"}}}"#, "unsupported url scheme"),
            (r#"{"servers": {" ": {"command": "a"}}}"#, "must not be empty"),
        ];
        for (json, expected) in cases {
            let err = parse_servers_json(json).unwrap_err();
            assert!(err.to_string().contains(expected), "{json}: {err}");
        }
    }

    #[test]
    fn test_locate_config_walks_upward() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let config = dir.path().join("mcp-servers.yaml");
        std::fs::write(&config, "servers: {}\n").unwrap();

        assert_eq!(locate_config(None, &nested).unwrap(), config);
    }

    #[test]
    fn test_locate_config_explicit_path() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("custom.json");
        std::fs::write(&config, r#"{"servers": {}}"#).unwrap();

        let found = locate_config(Some(config.display().to_string()), Path::new("/")).unwrap();
        assert_eq!(found, config);

        let missing = dir.path().join("nope.json").display().to_string();
        assert!(locate_config(Some(missing), Path::new("/")).is_err());
    }

    #[test]
    fn test_load_servers_config_by_extension() {
        let dir = TempDir::new().unwrap();
        let yaml = dir.path().join("mcp-servers.yml");
        std::fs::write(&yaml, "servers:\n  fs:\n    command: fs-server\n").unwrap();
        assert_eq!(load_servers_config(&yaml).unwrap()[0].name, "fs");

        let json = dir.path().join("mcp-servers.json");
        std::fs::write(&json, r#"{"servers": {"fs": {"command": "fs-server"}}}"#).unwrap();
        assert_eq!(load_servers_config(&json).unwrap().len(), 1);
    }
}
