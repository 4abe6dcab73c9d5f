use std::fmt;

use regex::Regex;
use tracing::{debug, warn};

use crate::common::ForwardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Regex,
    Suffix,
    Keyword,
}

impl RuleKind {
    fn prefix(self) -> &'static str {
        match self {
            RuleKind::Regex => "regex:",
            RuleKind::Suffix => "suffix:",
            RuleKind::Keyword => "keyword:",
        }
    }
}

/// 域名路由规则
#[derive(Debug)]
pub struct Rule {
    pattern: String,
    kind: RuleKind,
    upstream: String,
    /// 编译失败的正则为 None，永不匹配
    compiled: Option<Regex>,
}

impl Rule {
    /// Parse a `regex:` / `suffix:` / `keyword:` prefixed pattern.
    pub fn parse(raw: &str, upstream: &str) -> Result<Self, ForwardError> {
        let (kind, pattern) = [RuleKind::Regex, RuleKind::Suffix, RuleKind::Keyword]
            .into_iter()
            .find_map(|kind| raw.strip_prefix(kind.prefix()).map(|p| (kind, p)))
            .ok_or_else(|| ForwardError::Config(format!("invalid rule={}", raw)))?;

        let compiled = match kind {
            RuleKind::Regex => match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = pattern, error = %e, "ill-formed regex rule never matches");
                    None
                }
            },
            _ => None,
        };
        // 问题名已是小写；后缀规则写不写结尾的点都一样
        let pattern = match kind {
            RuleKind::Regex => pattern.to_string(),
            RuleKind::Suffix => pattern.trim_end_matches('.').to_ascii_lowercase(),
            RuleKind::Keyword => pattern.to_ascii_lowercase(),
        };

        Ok(Self {
            pattern,
            kind,
            upstream: upstream.to_string(),
            compiled,
        })
    }

    /// `domain` may be fully qualified; regex rules are tried against both
    /// the dotless and the dotted form.
    pub fn matches(&self, domain: &str) -> bool {
        let bare = domain.strip_suffix('.').unwrap_or(domain);
        match self.kind {
            RuleKind::Regex => self.compiled.as_ref().is_some_and(|re| {
                re.is_match(bare) || (bare.len() != domain.len() && re.is_match(domain))
            }),
            RuleKind::Suffix => bare.as_bytes().ends_with(self.pattern.as_bytes()),
            RuleKind::Keyword => domain.contains(self.pattern.as_str()),
        }
    }

    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}->{}", self.kind.prefix(), self.pattern, self.upstream)
    }
}

/// Ordered rule list; the first matching rule wins.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, raw: &str, upstream: &str) -> Result<(), ForwardError> {
        self.rules.push(Rule::parse(raw, upstream)?);
        Ok(())
    }

    /// Upstream id of the first matching rule, in insertion order.
    pub fn find(&self, domain: &str) -> Option<&str> {
        match self.rules.iter().find(|rule| rule.matches(domain)) {
            Some(rule) => {
                debug!(domain = domain, rule = %rule, "rule matched");
                Some(rule.upstream())
            }
            None => {
                debug!(domain = domain, "rule fallthrough");
                None
            }
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefixes() {
        assert_eq!(Rule::parse("regex:^a", "u").unwrap().kind(), RuleKind::Regex);
        assert_eq!(Rule::parse("suffix:a.com.", "u").unwrap().kind(), RuleKind::Suffix);
        let keyword = Rule::parse("keyword:ads", "u").unwrap();
        assert_eq!(keyword.kind(), RuleKind::Keyword);
        assert_eq!(keyword.pattern(), "ads");
    }

    #[test]
    fn parse_rejects_unknown_prefix() {
        let err = Rule::parse("domain:a.com", "u").unwrap_err();
        assert!(matches!(err, ForwardError::Config(_)));
        assert!(Rule::parse("a.com", "u").is_err());
    }

    #[test]
    fn first_match_wins() {
        let mut set = RuleSet::new();
        set.append("suffix:a.com", "U1").unwrap();
        set.append("keyword:a", "U2").unwrap();

        assert_eq!(set.find("x.a.com"), Some("U1"));
        assert_eq!(set.find("xa.org"), Some("U2"));
        assert_eq!(set.find("zzz.org"), None);
    }

    #[test]
    fn suffix_is_bytewise() {
        let rule = Rule::parse("suffix:ads.example.com.", "block").unwrap();
        assert!(rule.matches("ads.example.com."));
        assert!(rule.matches("xads.example.com."));
        assert!(!rule.matches("shop.example.com."));
    }

    #[test]
    fn dotted_and_dotless_patterns_match_alike() {
        let mut set = RuleSet::new();
        set.append("suffix:ads.example.com", "block").unwrap();
        set.append(r"regex:^cdn\.example\.com$", "cdn").unwrap();
        set.append("suffix:Shop.Example.COM.", "shop").unwrap();
        set.append("keyword:TRACKER", "block").unwrap();

        assert_eq!(set.find("ads.example.com."), Some("block"));
        assert_eq!(set.find("ads.example.com"), Some("block"));
        assert_eq!(set.find("cdn.example.com."), Some("cdn"));
        assert_eq!(set.find("www.shop.example.com."), Some("shop"));
        assert_eq!(set.find("tracker.example.org."), Some("block"));
        assert_eq!(set.rules()[2].pattern(), "shop.example.com");
    }

    #[test]
    fn regex_matches_full_domain() {
        let rule = Rule::parse(r"regex:^cdn\d+\.example\.com\.$", "cdn").unwrap();
        assert!(rule.matches("cdn12.example.com."));
        assert!(!rule.matches("cdn.example.com."));
    }

    #[test]
    fn malformed_regex_never_matches() {
        let mut set = RuleSet::new();
        set.append("regex:([a-z", "broken").unwrap();
        set.append("keyword:example", "ok").unwrap();

        assert_eq!(set.find("example.com."), Some("ok"));
        assert_eq!(set.find("([a-z"), None);
    }

    #[test]
    fn display_rule() {
        let rule = Rule::parse("keyword:ads", "block").unwrap();
        assert_eq!(rule.to_string(), "keyword:ads->block");
    }
}
