pub mod types;

use anyhow::Result;
use std::path::Path;

pub use types::{Config, ForwardConfig};

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(Path::new(path))
        .map_err(|e| anyhow::anyhow!("failed to read config '{}': {}", path, e))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
forwards:
  - from: ["example.com."]
    default: U0
    upstreams:
      - name: U0
        to: ["8.8.8.8"]
"#;

    #[test]
    fn parse_minimal_with_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.listen, "127.0.0.1:5353");

        let fwd = &config.forwards[0];
        assert_eq!(fwd.name, "forward");
        assert_eq!(fwd.policy, "random");
        assert_eq!(fwd.max_fails, 2);
        assert_eq!(fwd.expire, 10);
        assert_eq!(fwd.backup_delay(), None);
        assert_eq!(fwd.max_concurrent, 0);
        assert_eq!(fwd.timeout().as_millis(), 5000);
        assert_eq!(fwd.health_check.interval, 500);
        assert_eq!(fwd.health_check.domain, ".");
        assert!(fwd.health_check.recursion_desired);
        assert_eq!(fwd.reload_interval().as_secs(), 60);
    }

    #[test]
    fn parse_full_stanza() {
        let yaml = r#"
log:
  level: debug
listen: "0.0.0.0:53"
forwards:
  - name: main
    from: ["example.com.", "cn."]
    default: U0
    policy: round_robin
    max-fails: 3
    backup-request: 100
    max-concurrent: 64
    force-tcp: false
    prefer-udp: true
    tls-servername: dns.google
    health-check:
      interval: 1000
      domain: example.org.
      recursion-desired: false
    upstreams:
      - name: U0
        to: ["114.114.114.114", "tcp://223.5.5.5:53"]
      - name: U1
        to: ["tls://8.8.8.8:853", "https://dns.google/dns-query"]
        policy: sequential
      - name: block
        to: ["127.0.0.1:5300"]
    rules:
      - pattern: "suffix:ads.example.com."
        upstream: block
    geoip:
      database: Country.mmdb
      rules:
        - region: us
          upstream: U1
"#;
        let config = parse_config(yaml).unwrap();
        let fwd = &config.forwards[0];
        assert_eq!(fwd.name, "main");
        assert_eq!(fwd.max_fails, 3);
        assert_eq!(fwd.backup_delay().unwrap().as_millis(), 100);
        assert_eq!(fwd.upstreams[1].policy.as_deref(), Some("sequential"));
        assert_eq!(fwd.rules[0].upstream, "block");
        assert_eq!(fwd.geoip.as_ref().unwrap().rules[0].region, "us");
        assert!(!fwd.health_check.recursion_desired);
        assert_eq!(fwd.tls_servername.as_deref(), Some("dns.google"));
    }

    #[test]
    fn reject_unknown_default() {
        let yaml = MINIMAL.replace("default: U0", "default: nope");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("no upstream defined"));
    }

    #[test]
    fn reject_bad_rule_prefix() {
        let yaml = format!(
            "{}    rules:\n      - pattern: \"domain:a.com\"\n        upstream: U0\n",
            MINIMAL
        );
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn reject_bad_policy() {
        let yaml = MINIMAL.replace("default: U0", "default: U0\n    policy: fastest");
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn reject_too_many_upstreams() {
        let addrs: Vec<String> = (1..=16).map(|i| format!("\"10.0.0.{}\"", i)).collect();
        let yaml = MINIMAL.replace("[\"8.8.8.8\"]", &format!("[{}]", addrs.join(", ")));
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("more than 15"));
    }

    #[test]
    fn reject_zero_timeouts() {
        let yaml = MINIMAL.replace("default: U0", "default: U0\n    upstream-timeout: 0");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("upstream-timeout"));

        let yaml = MINIMAL.replace("default: U0", "default: U0\n    timeout: 0");
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn reject_duplicate_group() {
        let yaml = format!("{}      - name: U0\n        to: [\"1.1.1.1\"]\n", MINIMAL);
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.forwards.len(), 1);
        assert!(load_config("/nonexistent/config.yaml").is_err());
    }
}
