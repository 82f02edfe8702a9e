//! Mission briefs: the structured reading of an operator's prompt.
//!
//! [`BriefExtractor`] asks each configured text-generation provider in turn for a
//! JSON brief. Rate-limit, server and network failures move on to the next
//! provider; any other failure stops the cascade. Whatever happens, the caller
//! gets a brief: the keyword rules in [`rules`] are the last resort.

pub mod rules;

use serde::{Deserialize, Serialize};

use crate::llm::{ProviderError, ProviderRef};

/// Who the mission is looking for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetPersona {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Financial attributes of the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialProfile {
    /// Assets the target holds ("401k", "retirement funds")
    #[serde(default)]
    pub has: Vec<String>,
    /// Minimum annual salary in dollars
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_salary: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "interestIn")]
    pub interest_in: Option<String>,
}

impl FinancialProfile {
    pub fn is_empty(&self) -> bool {
        self.has.is_empty() && self.min_salary.is_none() && self.interest_in.is_none()
    }
}

/// Structured search filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Relative window such as `past_30_days`
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "dateRange")]
    pub date_range: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "financialProfile"
    )]
    pub financial_profile: Option<FinancialProfile>,
}

/// What the operator is offering to the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Structured interpretation of a natural-language request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionBrief {
    /// Intent tag driving plan selection, e.g. `SEARCH_LAYOFF_EVENTS`
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "intent")]
    pub action: Option<String>,
    #[serde(default, alias = "targetPersona")]
    pub target_persona: TargetPersona,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offering: Option<Offering>,
    /// The prompt exactly as the operator typed it
    #[serde(default, alias = "rawPrompt")]
    pub raw_prompt: String,
}

impl MissionBrief {
    /// Fill fields the provider left empty from a rule-derived brief.
    fn fill_gaps_from(&mut self, fallback: MissionBrief) {
        if self.action.is_none() {
            self.action = fallback.action;
        }
        if self.target_persona.description.is_none() {
            self.target_persona.description = fallback.target_persona.description;
        }
        if self.target_persona.keywords.is_empty() {
            self.target_persona.keywords = fallback.target_persona.keywords;
        }
        let filters = &mut self.filters;
        if filters.industry.is_none() {
            filters.industry = fallback.filters.industry;
        }
        if filters.location.is_none() {
            filters.location = fallback.filters.location;
        }
        if filters.date_range.is_none() {
            filters.date_range = fallback.filters.date_range;
        }
        if filters.financial_profile.is_none() {
            filters.financial_profile = fallback.filters.financial_profile;
        }
        if self.offering.is_none() {
            self.offering = fallback.offering;
        }
    }
}

/// Which path produced a brief.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BriefSource {
    Provider(String),
    Rules,
}

impl std::fmt::Display for BriefSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(name) => write!(f, "provider:{}", name),
            Self::Rules => write!(f, "rules"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub brief: MissionBrief,
    pub source: BriefSource,
}

const EXTRACTION_INSTRUCTIONS: &str = r#"You turn an operator's request into a MissionBrief for a lead-generation platform.
Respond with a single JSON object and nothing else, using exactly these keys:
{
  "action": one of "SEARCH_LAYOFF_EVENTS", "PROSPECT_CONTACTS", "ENRICH_CONTACTS",
  "target_persona": { "description": string, "keywords": [string] },
  "filters": {
    "industry": string or null,
    "location": string or null (US state name, e.g. "California"),
    "date_range": string or null (form "past_<N>_days"),
    "financial_profile": { "has": [string], "min_salary": number or null, "interest_in": string or null } or null
  },
  "offering": { "product": string or null, "category": string or null } or null
}"#;

fn extraction_prompt(prompt: &str) -> String {
    format!("{}\n\nUser prompt:\n\"\"\"{}\"\"\"", EXTRACTION_INSTRUCTIONS, prompt)
}

/// Strip a Markdown code fence if the model wrapped its JSON in one.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_brief(text: &str) -> Result<MissionBrief, ProviderError> {
    serde_json::from_str(strip_code_fence(text))
        .map_err(|e| ProviderError::parse_error(format!("Provider returned invalid brief: {}", e)))
}

/// Converts raw prompts into briefs through the provider cascade.
pub struct BriefExtractor {
    providers: Vec<ProviderRef>,
}

impl BriefExtractor {
    pub fn new(providers: Vec<ProviderRef>) -> Self {
        Self { providers }
    }

    /// Extractor with no providers; every prompt goes straight to the rules.
    pub fn rules_only() -> Self {
        Self::new(Vec::new())
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Extract a brief. Never fails: provider errors end in the rule extractor.
    pub async fn extract(&self, prompt: &str) -> Extraction {
        let request = extraction_prompt(prompt);

        for provider in &self.providers {
            let attempt = match provider.generate(&request).await {
                Ok(text) => parse_brief(&text),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(mut brief) => {
                    brief.raw_prompt = prompt.to_string();
                    brief.fill_gaps_from(rules::extract(prompt));
                    tracing::info!("Brief extracted by provider {}", provider.name());
                    return Extraction {
                        brief,
                        source: BriefSource::Provider(provider.name().to_string()),
                    };
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "Provider {} unavailable ({}); trying next provider",
                        provider.name(),
                        e
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Provider {} failed ({}); falling back to rule extractor",
                        provider.name(),
                        e
                    );
                    break;
                }
            }
        }

        tracing::info!("Brief extracted by keyword rules");
        Extraction {
            brief: rules::extract(prompt),
            source: BriefSource::Rules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TextProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedProvider {
        name: &'static str,
        reply: fn() -> Result<String, ProviderError>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(name: &'static str, reply: fn() -> Result<String, ProviderError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TextProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, _prompt: &str) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)()
        }
    }

    const PROMPT: &str = "tech layoffs in california last month";

    #[tokio::test]
    async fn test_rate_limit_cascades_to_next_provider() {
        let primary = ScriptedProvider::new("openai", || {
            Err(ProviderError::rate_limited("quota".to_string()))
        });
        let secondary = ScriptedProvider::new("gemini", || {
            Ok(r#"```json
{"action":"SEARCH_LAYOFF_EVENTS","target_persona":{"description":"Laid-off engineers","keywords":[]},"filters":{"location":"California"}}
```"#
                .to_string())
        });
        let extractor = BriefExtractor::new(vec![primary.clone() as ProviderRef, secondary.clone()]);

        let extraction = extractor.extract(PROMPT).await;

        assert_eq!(extraction.source, BriefSource::Provider("gemini".to_string()));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(extraction.brief.raw_prompt, PROMPT);
        assert_eq!(
            extraction.brief.target_persona.description.as_deref(),
            Some("Laid-off engineers")
        );
        // Gaps the model left are filled by the rules
        assert_eq!(
            extraction.brief.filters.date_range.as_deref(),
            Some("past_30_days")
        );
    }

    #[tokio::test]
    async fn test_hard_failure_skips_remaining_providers() {
        let primary = ScriptedProvider::new("openai", || {
            Err(ProviderError::client_error(401, "bad key".to_string()))
        });
        let secondary = ScriptedProvider::new("gemini", || Ok("{}".to_string()));
        let extractor = BriefExtractor::new(vec![primary.clone() as ProviderRef, secondary.clone()]);

        let extraction = extractor.extract(PROMPT).await;

        assert_eq!(extraction.source, BriefSource::Rules);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            extraction.brief.filters.industry.as_deref(),
            Some("Technology")
        );
    }

    #[tokio::test]
    async fn test_unparsable_reply_falls_back_to_rules() {
        let primary = ScriptedProvider::new("openai", || Ok("Sure! Here you go.".to_string()));
        let extractor = BriefExtractor::new(vec![primary as ProviderRef]);

        let extraction = extractor.extract(PROMPT).await;

        assert_eq!(extraction.source, BriefSource::Rules);
        assert_eq!(
            extraction.brief.action.as_deref(),
            Some(rules::ACTION_SEARCH_LAYOFF_EVENTS)
        );
    }

    #[tokio::test]
    async fn test_all_transient_failures_end_in_rules() {
        let primary = ScriptedProvider::new("openai", || {
            Err(ProviderError::server_error(503, "down".to_string()))
        });
        let secondary = ScriptedProvider::new("venice", || {
            Err(ProviderError::network_error("reset".to_string()))
        });
        let extractor = BriefExtractor::new(vec![primary as ProviderRef, secondary.clone()]);

        let extraction = extractor.extract(PROMPT).await;

        assert_eq!(extraction.source, BriefSource::Rules);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(extraction.brief.raw_prompt, PROMPT);
    }

    #[test]
    fn test_brief_accepts_camel_case_keys() {
        let brief: MissionBrief = serde_json::from_str(
            r#"{"intent":"PROSPECT_CONTACTS","targetPersona":{"description":"PMs"},"rawPrompt":"x","filters":{"dateRange":"past_7_days"}}"#,
        )
        .unwrap();
        assert_eq!(brief.action.as_deref(), Some("PROSPECT_CONTACTS"));
        assert_eq!(brief.target_persona.description.as_deref(), Some("PMs"));
        assert_eq!(brief.filters.date_range.as_deref(), Some("past_7_days"));
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }
}
