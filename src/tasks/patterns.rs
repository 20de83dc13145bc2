//! Keyword and regex matching for classifying bot replies, plus the fuzzy
//! matcher that maps a solver's answer back to a button label.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One classification rule: any keyword hit or a regex match triggers it.
/// `extract_regex` optionally pulls a payload (e.g. awarded points) out of
/// the matched text via its first capture group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePattern {
    pub keywords: Vec<String>,
    pub regex: Option<String>,
    pub extract_regex: Option<String>,
}

impl MessagePattern {
    pub fn keywords(words: &[&str]) -> Self {
        Self {
            keywords: words.iter().map(|w| w.to_string()).collect(),
            regex: None,
            extract_regex: None,
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        if self.keywords.iter().any(|kw| text.contains(kw.as_str())) {
            return true;
        }
        match self.regex.as_deref() {
            Some(pattern) => Regex::new(pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn extract(&self, text: &str) -> Option<String> {
        let pattern = self.extract_regex.as_deref()?;
        let re = Regex::new(pattern).ok()?;
        re.captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Ensure the configured expressions compile, so a bad pattern surfaces
    /// when the task is created rather than mid-run.
    pub fn check(&self) -> Result<()> {
        if let Some(pattern) = self.regex.as_deref() {
            Regex::new(pattern).with_context(|| format!("invalid regex '{pattern}'"))?;
        }
        if let Some(pattern) = self.extract_regex.as_deref() {
            Regex::new(pattern).with_context(|| format!("invalid extract regex '{pattern}'"))?;
        }
        Ok(())
    }
}

/// Strip everything but letters and digits and lowercase the rest. Button
/// labels often carry emoji or decorative symbols that the solver's answer
/// will not reproduce.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Map a free-text answer onto one of the candidate labels: exact match
/// first, then substring either way, then the same two passes over
/// symbol-stripped forms.
pub fn best_match<'a>(answer: &str, options: &'a [String]) -> Option<&'a String> {
    if answer.trim().is_empty() || options.is_empty() {
        return None;
    }
    let wanted = answer.trim().to_lowercase();

    if let Some(hit) = options.iter().find(|o| o.trim().to_lowercase() == wanted) {
        return Some(hit);
    }
    if let Some(hit) = options.iter().find(|o| {
        let label = o.to_lowercase();
        label.contains(&wanted) || wanted.contains(&label)
    }) {
        return Some(hit);
    }

    let wanted_clean = clean_text(answer);
    if wanted_clean.is_empty() {
        return None;
    }
    options.iter().find(|o| {
        let label_clean = clean_text(o);
        !label_clean.is_empty()
            && (label_clean == wanted_clean
                || label_clean.contains(&wanted_clean)
                || wanted_clean.contains(&label_clean))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_hit_matches() {
        let p = MessagePattern::keywords(&["签到成功", "恭喜"]);
        assert!(p.is_match("恭喜您获得 10 积分"));
        assert!(!p.is_match("something else"));
        assert!(!p.is_match(""));
    }

    #[test]
    fn regex_matches_when_no_keyword_hits() {
        let p = MessagePattern {
            keywords: vec![],
            regex: Some(r"checked in \d+ times".into()),
            extract_regex: None,
        };
        assert!(p.is_match("you have checked in 3 times"));
        assert!(!p.is_match("no numbers here"));
    }

    #[test]
    fn extract_pulls_first_capture_group() {
        let p = MessagePattern {
            keywords: vec!["获得".into()],
            regex: None,
            extract_regex: Some(r"[+＋]?\s*(\d+)\s*[积分点]".into()),
        };
        assert!(p.is_match("签到成功，获得 +25 积分"));
        assert_eq!(p.extract("签到成功，获得 +25 积分"), Some("25".into()));
        assert_eq!(p.extract("获得奖励"), None);
    }

    #[test]
    fn check_rejects_broken_regexes() {
        let p = MessagePattern {
            keywords: vec![],
            regex: Some("([unclosed".into()),
            extract_regex: None,
        };
        assert!(p.check().is_err());
        assert!(MessagePattern::default().check().is_ok());
    }

    #[test]
    fn clean_text_strips_symbols_and_case() {
        assert_eq!(clean_text("✅ 签到 OK!"), "签到ok");
        assert_eq!(clean_text("🎁🎁"), "");
    }

    #[test]
    fn best_match_prefers_exact_then_substring_then_cleaned() {
        let options = vec!["✅ Apple".to_string(), "Banana".to_string()];
        assert_eq!(best_match("banana", &options), Some(&options[1]));
        assert_eq!(best_match("an apple", &options), Some(&options[0]));
        assert_eq!(best_match("apple", &options), Some(&options[0]));
        assert_eq!(best_match("cherry", &options), None);
        assert_eq!(best_match("", &options), None);
    }
}
