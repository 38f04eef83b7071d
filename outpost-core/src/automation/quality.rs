//! AI quality policy evaluation.
//!
//! Per-(tenant, project) policies score generated text on tone, caps ratio,
//! punctuation, hashtags, and forbidden topics; the composite risk score
//! routes content to manual review when it crosses the policy threshold.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::store::models::ContentStatus;

/// Policy knobs with the platform defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityPolicy {
    #[serde(default)]
    pub brand_voice_keywords: Vec<String>,
    #[serde(default)]
    pub forbidden_topics: Vec<String>,
    #[serde(default = "default_max_caps_ratio")]
    pub max_caps_ratio: f64,
    #[serde(default = "default_max_exclamation_count")]
    pub max_exclamation_count: u32,
    #[serde(default = "default_require_approval_risk_score")]
    pub require_approval_risk_score: f64,
}

fn default_max_caps_ratio() -> f64 {
    0.35
}
fn default_max_exclamation_count() -> u32 {
    4
}
fn default_require_approval_risk_score() -> f64 {
    0.65
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            brand_voice_keywords: Vec::new(),
            forbidden_topics: Vec::new(),
            max_caps_ratio: default_max_caps_ratio(),
            max_exclamation_count: default_max_exclamation_count(),
            require_approval_risk_score: default_require_approval_risk_score(),
        }
    }
}

impl QualityPolicy {
    /// Parse a stored policy JSON document, filling defaults.
    pub fn from_json(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Result of evaluating one piece of text against a policy.
#[derive(Debug, Clone)]
pub struct QualityEvaluation {
    pub risk_score: f64,
    pub tone_score: f64,
    pub risk_flags: Vec<String>,
    pub needs_approval: bool,
    pub caps_ratio: f64,
    pub exclamation_count: u32,
    pub hashtag_count: u32,
    pub forbidden_matches: Vec<String>,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

pub fn evaluate_text(text: &str, title: Option<&str>, policy: &QualityPolicy) -> QualityEvaluation {
    let normalized_text = format!("{}\n{}", title.unwrap_or(""), text)
        .trim()
        .to_lowercase();
    let forbidden_topics: Vec<String> = policy
        .forbidden_topics
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let voice_keywords: Vec<String> = policy
        .brand_voice_keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();

    let mut flags: Vec<String> = Vec::new();
    let forbidden_matches: Vec<String> = forbidden_topics
        .iter()
        .filter(|topic| normalized_text.contains(topic.as_str()))
        .cloned()
        .collect();
    if !forbidden_matches.is_empty() {
        flags.push("forbidden_topic".to_string());
    }

    let alpha_count = text.chars().filter(|c| c.is_alphabetic()).count();
    let upper_count = text
        .chars()
        .filter(|c| c.is_alphabetic() && c.is_uppercase())
        .count();
    let caps_ratio = if alpha_count > 0 {
        upper_count as f64 / alpha_count as f64
    } else {
        0.0
    };
    if caps_ratio > policy.max_caps_ratio {
        flags.push("shouting_style".to_string());
    }

    let exclamation_count = text.chars().filter(|c| *c == '!').count() as u32;
    if exclamation_count > policy.max_exclamation_count {
        flags.push("aggressive_punctuation".to_string());
    }

    let tone_hits = voice_keywords
        .iter()
        .filter(|keyword| normalized_text.contains(keyword.as_str()))
        .count();
    let tone_score = if voice_keywords.is_empty() {
        1.0
    } else {
        tone_hits as f64 / voice_keywords.len() as f64
    };
    if tone_score < 0.4 {
        flags.push("tone_mismatch".to_string());
    }

    let hashtag_count = text
        .split_whitespace()
        .filter(|token| {
            token.starts_with('#') && token.chars().nth(1).map(char::is_alphanumeric).unwrap_or(false)
        })
        .count() as u32;
    if hashtag_count > 12 {
        flags.push("hashtag_overload".to_string());
    }

    let forbidden_weight = if forbidden_matches.is_empty() { 0.0 } else { 0.25 };
    let risk_score =
        (flags.len() as f64 * 0.22 + forbidden_weight + (1.0 - tone_score) * 0.25).min(1.0);
    let needs_approval = risk_score >= policy.require_approval_risk_score;

    let risk_flags = if flags.is_empty() {
        vec!["none".to_string()]
    } else {
        flags
    };

    QualityEvaluation {
        risk_score: round4(risk_score),
        tone_score: round4(tone_score),
        risk_flags,
        needs_approval,
        caps_ratio: round4(caps_ratio),
        exclamation_count,
        hashtag_count,
        forbidden_matches,
    }
}

/// Merge the evaluation into content item metadata under `quality`.
pub fn apply_quality_to_metadata(metadata: &Value, evaluation: &QualityEvaluation) -> Value {
    let mut merged = metadata.clone();
    if !merged.is_object() {
        merged = json!({});
    }
    if let Some(object) = merged.as_object_mut() {
        object.insert(
            "quality".to_string(),
            json!({
                "risk_score": evaluation.risk_score,
                "tone_score": evaluation.tone_score,
                "risk_flags": evaluation.risk_flags,
                "needs_approval": evaluation.needs_approval,
                "forbidden_matches": evaluation.forbidden_matches,
                "caps_ratio": evaluation.caps_ratio,
                "exclamation_count": evaluation.exclamation_count,
                "hashtag_count": evaluation.hashtag_count,
            }),
        );
    }
    merged
}

/// Downgrade content to review when the evaluation demands approval.
pub fn choose_content_status(current: ContentStatus, evaluation: &QualityEvaluation) -> ContentStatus {
    if evaluation.needs_approval {
        ContentStatus::NeedsReview
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_scores_zero() {
        let policy = QualityPolicy::default();
        let evaluation = evaluate_text("A calm, informative update about our product.", None, &policy);
        assert_eq!(evaluation.risk_score, 0.0);
        assert_eq!(evaluation.tone_score, 1.0);
        assert_eq!(evaluation.risk_flags, vec!["none"]);
        assert!(!evaluation.needs_approval);
    }

    #[test]
    fn test_forbidden_topic_flagged() {
        let policy = QualityPolicy {
            forbidden_topics: vec!["crypto".into()],
            ..Default::default()
        };
        let evaluation = evaluate_text("Buy CRYPTO now", Some("Crypto tips"), &policy);
        assert!(evaluation.risk_flags.contains(&"forbidden_topic".to_string()));
        assert_eq!(evaluation.forbidden_matches, vec!["crypto"]);
        assert!(evaluation.risk_score > 0.0);
    }

    #[test]
    fn test_shouting_and_punctuation() {
        let policy = QualityPolicy::default();
        let evaluation = evaluate_text("BUY NOW!!!!! AMAZING DEAL!!!", None, &policy);
        assert!(evaluation.risk_flags.contains(&"shouting_style".to_string()));
        assert!(evaluation
            .risk_flags
            .contains(&"aggressive_punctuation".to_string()));
        assert!(evaluation.caps_ratio > 0.35);
        assert!(evaluation.exclamation_count > 4);
    }

    #[test]
    fn test_tone_score_from_keywords() {
        let policy = QualityPolicy {
            brand_voice_keywords: vec!["reliable".into(), "simple".into(), "fast".into(), "open".into()],
            ..Default::default()
        };
        let evaluation = evaluate_text("Our reliable and simple platform.", None, &policy);
        assert_eq!(evaluation.tone_score, 0.5);
        assert!(!evaluation.risk_flags.contains(&"tone_mismatch".to_string()));

        let off_tone = evaluate_text("Completely unrelated message.", None, &policy);
        assert_eq!(off_tone.tone_score, 0.0);
        assert!(off_tone.risk_flags.contains(&"tone_mismatch".to_string()));
    }

    #[test]
    fn test_hashtag_overload() {
        let policy = QualityPolicy::default();
        let hashtags: Vec<String> = (0..13).map(|i| format!("#tag{i}")).collect();
        let text = format!("Launch day {}", hashtags.join(" "));
        let evaluation = evaluate_text(&text, None, &policy);
        assert_eq!(evaluation.hashtag_count, 13);
        assert!(evaluation
            .risk_flags
            .contains(&"hashtag_overload".to_string()));
    }

    #[test]
    fn test_needs_approval_threshold() {
        let policy = QualityPolicy {
            forbidden_topics: vec!["gambling".into()],
            brand_voice_keywords: vec!["friendly".into()],
            require_approval_risk_score: 0.65,
            ..Default::default()
        };
        // forbidden + tone mismatch: 2 flags * 0.22 + 0.25 + 0.25 = 0.94
        let evaluation = evaluate_text("GAMBLING wins big", None, &policy);
        assert!(evaluation.needs_approval);
        assert_eq!(
            choose_content_status(ContentStatus::Draft, &evaluation),
            ContentStatus::NeedsReview
        );
    }

    #[test]
    fn test_metadata_merge() {
        let policy = QualityPolicy::default();
        let evaluation = evaluate_text("Fine text.", None, &policy);
        let merged = apply_quality_to_metadata(&json!({ "existing": 1 }), &evaluation);
        assert_eq!(merged["existing"], 1);
        assert_eq!(merged["quality"]["risk_score"], 0.0);
        assert_eq!(merged["quality"]["risk_flags"][0], "none");
    }

    #[test]
    fn test_policy_json_defaults() {
        let policy = QualityPolicy::from_json(&json!({ "max_caps_ratio": 0.5 }));
        assert_eq!(policy.max_caps_ratio, 0.5);
        assert_eq!(policy.max_exclamation_count, 4);
        assert!((policy.require_approval_risk_score - 0.65).abs() < f64::EPSILON);
    }
}
