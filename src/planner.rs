//! Mission planner: turns a [`MissionBrief`] into an ordered [`ExecutionPlan`].
//!
//! Plans are linear chains. Each step names the agent that fulfils it, a
//! parameter bag, and the output key later steps use to consume its result.
//! The planner is a fixed decision table keyed on the brief's action, so the
//! same brief always yields the same plan.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

use crate::brief::rules::{
    ACTION_ENRICH_CONTACTS, ACTION_PROSPECT_CONTACTS, ACTION_SEARCH_LAYOFF_EVENTS,
};
use crate::brief::{MissionBrief, TargetPersona};
use crate::error::MissionError;

/// Action tag recorded on briefs synthesised for operator-supplied blueprints.
pub const ACTION_BLUEPRINT: &str = "BLUEPRINT";

/// Parameters handed to an agent. `input_source` names an earlier step's
/// output key; every other key is passed through as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_source: Option<String>,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl StepParams {
    fn from_values(values: Map<String, Value>) -> Self {
        Self {
            input_source: None,
            values,
        }
    }

    fn consuming(input_source: &str, values: Map<String, Value>) -> Self {
        Self {
            input_source: Some(input_source.to_string()),
            values,
        }
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based ordinal
    pub step: u32,
    pub agent: String,
    #[serde(default)]
    pub params: StepParams,
    pub output_key: String,
    #[serde(default)]
    pub description: String,
}

/// Ordered list of steps derived from a brief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub summary: String,
    pub steps: Vec<Step>,
}

impl ExecutionPlan {
    /// Check the structural invariants every persisted plan must satisfy:
    /// contiguous 1-based step numbers, non-empty agent names, unique output
    /// keys, and input sources that refer to an earlier step.
    pub fn validate(&self) -> Result<(), MissionError> {
        if self.steps.is_empty() {
            return Err(MissionError::MalformedPlan("plan has no steps".to_string()));
        }
        let mut seen_keys: HashSet<&str> = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.step != expected {
                return Err(MissionError::MalformedPlan(format!(
                    "step at position {} is numbered {} (expected {})",
                    expected, step.step, expected
                )));
            }
            if step.agent.trim().is_empty() {
                return Err(MissionError::MalformedPlan(format!(
                    "step {} has no agent",
                    step.step
                )));
            }
            if let Some(source) = step.params.input_source.as_deref() {
                if !seen_keys.contains(source) {
                    return Err(MissionError::MalformedPlan(format!(
                        "step {} reads '{}' which no earlier step produces",
                        step.step, source
                    )));
                }
            }
            if step.output_key.trim().is_empty() {
                return Err(MissionError::MalformedPlan(format!(
                    "step {} has no output key",
                    step.step
                )));
            }
            if !seen_keys.insert(step.output_key.as_str()) {
                return Err(MissionError::MalformedPlan(format!(
                    "output key '{}' is declared twice",
                    step.output_key
                )));
            }
        }
        Ok(())
    }

    /// Agent names in execution order.
    pub fn agents(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.agent.as_str()).collect()
    }
}

fn derive_plan_id<T: Serialize>(seed: &T) -> String {
    let bytes = serde_json::to_vec(seed).unwrap_or_default();
    format!("plan-{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, &bytes))
}

fn insert_opt(values: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        values.insert(key.to_string(), Value::String(v.to_string()));
    }
}

fn numbered(steps: Vec<(&str, StepParams, &str, String)>) -> Vec<Step> {
    steps
        .into_iter()
        .enumerate()
        .map(|(i, (agent, params, output_key, description))| Step {
            step: i as u32 + 1,
            agent: agent.to_string(),
            params,
            output_key: output_key.to_string(),
            description,
        })
        .collect()
}

fn layoff_template(brief: &MissionBrief, persona: &str) -> (String, Vec<Step>) {
    let filters = &brief.filters;
    let mut scout = Map::new();
    insert_opt(&mut scout, "location", filters.location.as_deref());
    insert_opt(&mut scout, "date_range", filters.date_range.as_deref());
    insert_opt(&mut scout, "industry", filters.industry.as_deref());

    let mut enrich = Map::new();
    enrich.insert(
        "persona_keywords".to_string(),
        json!(brief.target_persona.keywords),
    );

    let scope = filters
        .location
        .as_deref()
        .map(|l| format!(" in {}", l))
        .unwrap_or_default();
    let steps = numbered(vec![
        (
            "scout-warn",
            StepParams::from_values(scout),
            "warn_notices",
            format!("Acquire layoff events from WARN notices{}.", scope),
        ),
        (
            "marketer-agent",
            StepParams::consuming("warn_notices", enrich),
            "enriched_leads",
            "Enrich the new layoff leads with company domains and contacts.".to_string(),
        ),
    ]);
    let summary = format!(
        "Find {} through WARN layoff notices{} and enrich them into leads.",
        persona.to_lowercase(),
        scope
    );
    (summary, steps)
}

fn prospect_template(brief: &MissionBrief, persona: &str) -> (String, Vec<Step>) {
    let filters = &brief.filters;
    let query = match filters.location.as_deref() {
        Some(location) => format!("{} in {}", persona, location),
        None => persona.to_string(),
    };
    let mut search = Map::new();
    search.insert("query".to_string(), Value::String(query.clone()));
    insert_opt(&mut search, "date_range", filters.date_range.as_deref());

    let mut scrape = Map::new();
    scrape.insert("filters".to_string(), json!(brief.target_persona.keywords));

    let mut score = Map::new();
    score.insert(
        "scoring_criteria".to_string(),
        filters
            .financial_profile
            .as_ref()
            .map(|p| json!(p))
            .unwrap_or_else(|| json!({})),
    );

    let mut craft = Map::new();
    craft.insert(
        "offering_details".to_string(),
        brief
            .offering
            .as_ref()
            .map(|o| json!(o))
            .unwrap_or(Value::Null),
    );

    let product = brief
        .offering
        .as_ref()
        .and_then(|o| o.product.as_deref())
        .unwrap_or("the client's offering");
    let steps = numbered(vec![
        (
            "google-search",
            StepParams::from_values(search),
            "initial_entity_list",
            format!("Identify entities related to '{}'.", query),
        ),
        (
            "scout-selenium-py",
            StepParams::consuming("initial_entity_list", scrape),
            "raw_contact_profiles",
            "Find specific contacts within the identified entities.".to_string(),
        ),
        (
            "lead-scorer",
            StepParams::consuming("raw_contact_profiles", score),
            "ranked_leads",
            "Rank the raw contacts to identify high-value leads.".to_string(),
        ),
        (
            "campaign-crafter",
            StepParams::consuming("ranked_leads", craft),
            "outreach_campaigns",
            format!("Draft outreach for the top-ranked leads about {}.", product),
        ),
    ]);
    let summary = format!(
        "A multi-step plan to identify and engage {} for {}.",
        persona.to_lowercase(),
        product
    );
    (summary, steps)
}

fn enrich_template(brief: &MissionBrief, persona: &str) -> (String, Vec<Step>) {
    let filters = &brief.filters;
    let mut scout = Map::new();
    scout.insert("keywords".to_string(), json!(brief.target_persona.keywords));
    insert_opt(&mut scout, "location", filters.location.as_deref());
    insert_opt(&mut scout, "industry", filters.industry.as_deref());

    let steps = numbered(vec![
        (
            "scout-salesnav",
            StepParams::from_values(scout),
            "salesnav_profiles",
            format!("Collect Sales Navigator profiles for {}.", persona),
        ),
        (
            "marketer-enrich",
            StepParams::consuming("salesnav_profiles", Map::new()),
            "enriched_contacts",
            "Enrich the collected profiles with verified contact data.".to_string(),
        ),
    ]);
    let summary = format!("Collect and enrich contact data for {}.", persona.to_lowercase());
    (summary, steps)
}

/// Build the execution plan for a brief.
///
/// Fails with [`MissionError::MalformedBrief`] when the brief has no action, no
/// persona description, or an action outside the decision table.
pub fn plan(brief: &MissionBrief) -> Result<ExecutionPlan, MissionError> {
    let action = brief
        .action
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| MissionError::MalformedBrief("brief has no action".to_string()))?;
    let persona = brief
        .target_persona
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| {
            MissionError::MalformedBrief("brief has no target persona description".to_string())
        })?;

    let (summary, steps) = match action.to_uppercase().as_str() {
        ACTION_SEARCH_LAYOFF_EVENTS => layoff_template(brief, persona),
        ACTION_PROSPECT_CONTACTS => prospect_template(brief, persona),
        ACTION_ENRICH_CONTACTS => enrich_template(brief, persona),
        other => {
            return Err(MissionError::MalformedBrief(format!(
                "no plan template for action '{}'",
                other
            )))
        }
    };

    let plan = ExecutionPlan {
        plan_id: derive_plan_id(brief),
        summary,
        steps,
    };
    plan.validate()?;
    tracing::debug!(
        "Planned {} ({} steps) for action {}",
        plan.plan_id,
        plan.steps.len(),
        action
    );
    Ok(plan)
}

/// A step supplied directly by an operator instead of derived from a brief.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintStep {
    /// Optional explicit ordinal; must match the step's position when present
    #[serde(default)]
    pub step: Option<u32>,
    pub agent: String,
    #[serde(default)]
    pub params: StepParams,
    #[serde(default, alias = "output_key")]
    pub output_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Build a plan from an operator-supplied step list.
pub fn plan_from_blueprint(
    mission_name: &str,
    blueprint: &[BlueprintStep],
) -> Result<ExecutionPlan, MissionError> {
    if mission_name.trim().is_empty() {
        return Err(MissionError::MalformedPlan(
            "blueprint has no mission name".to_string(),
        ));
    }
    let mut steps = Vec::with_capacity(blueprint.len());
    for (index, entry) in blueprint.iter().enumerate() {
        let ordinal = index as u32 + 1;
        if let Some(explicit) = entry.step {
            if explicit != ordinal {
                return Err(MissionError::MalformedPlan(format!(
                    "blueprint step at position {} is numbered {}",
                    ordinal, explicit
                )));
            }
        }
        steps.push(Step {
            step: ordinal,
            agent: entry.agent.trim().to_string(),
            params: entry.params.clone(),
            output_key: entry
                .output_key
                .clone()
                .unwrap_or_else(|| format!("step_{}_output", ordinal)),
            description: entry
                .description
                .clone()
                .unwrap_or_else(|| format!("Run {}", entry.agent.trim())),
        });
    }

    let plan = ExecutionPlan {
        plan_id: derive_plan_id(&(mission_name, &steps)),
        summary: mission_name.trim().to_string(),
        steps,
    };
    plan.validate()?;
    Ok(plan)
}

/// Brief recorded alongside a blueprint mission so every mission carries one.
pub fn blueprint_brief(mission_name: &str) -> MissionBrief {
    MissionBrief {
        action: Some(ACTION_BLUEPRINT.to_string()),
        target_persona: TargetPersona {
            description: Some(mission_name.to_string()),
            keywords: Vec::new(),
        },
        raw_prompt: mission_name.to_string(),
        ..MissionBrief::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brief::rules;

    #[test]
    fn test_layoff_brief_yields_two_step_plan() {
        let brief = rules::extract("tech layoffs in california last month");
        let plan = plan(&brief).unwrap();

        assert_eq!(plan.agents(), vec!["scout-warn", "marketer-agent"]);
        assert_eq!(plan.steps[0].step, 1);
        assert_eq!(plan.steps[1].step, 2);
        assert_eq!(
            plan.steps[0].params.values.get("location"),
            Some(&json!("California"))
        );
        assert_eq!(
            plan.steps[1].params.input_source.as_deref(),
            Some("warn_notices")
        );
        assert!(plan.plan_id.starts_with("plan-"));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let brief = rules::extract("find software engineers in texas");
        assert_eq!(plan(&brief).unwrap(), plan(&brief).unwrap());
    }

    #[test]
    fn test_prospect_plan_chains_four_agents() {
        let brief = rules::extract("find product managers in new york and offer an investment tool to them");
        let plan = plan(&brief).unwrap();
        assert_eq!(
            plan.agents(),
            vec![
                "google-search",
                "scout-selenium-py",
                "lead-scorer",
                "campaign-crafter"
            ]
        );
        let keys: HashSet<&str> = plan.steps.iter().map(|s| s.output_key.as_str()).collect();
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn test_missing_action_is_malformed_brief() {
        let mut brief = rules::extract("tech layoffs in california");
        brief.action = None;
        assert!(matches!(plan(&brief), Err(MissionError::MalformedBrief(_))));
    }

    #[test]
    fn test_missing_persona_is_malformed_brief() {
        let mut brief = rules::extract("tech layoffs in california");
        brief.target_persona.description = Some("   ".to_string());
        assert!(matches!(plan(&brief), Err(MissionError::MalformedBrief(_))));
    }

    #[test]
    fn test_unknown_action_is_malformed_brief() {
        let mut brief = rules::extract("tech layoffs in california");
        brief.action = Some("LAUNCH_ROCKETS".to_string());
        assert!(matches!(plan(&brief), Err(MissionError::MalformedBrief(_))));
    }

    #[test]
    fn test_step_params_flatten_input_source() {
        let params: StepParams =
            serde_json::from_value(json!({"input_source": "warn_notices", "limit": 5})).unwrap();
        assert_eq!(params.input_source.as_deref(), Some("warn_notices"));
        assert_eq!(params.values.get("limit"), Some(&json!(5)));
        assert!(!params.values.contains_key("input_source"));
    }

    #[test]
    fn test_blueprint_numbers_and_validates() {
        let blueprint: Vec<BlueprintStep> = serde_json::from_value(json!([
            {"agent": "scout-warn", "outputKey": "notices"},
            {"agent": "marketer-agent", "params": {"input_source": "notices"}}
        ]))
        .unwrap();
        let plan = plan_from_blueprint("Weekly WARN sweep", &blueprint).unwrap();
        assert_eq!(plan.steps[1].step, 2);
        assert_eq!(plan.steps[1].output_key, "step_2_output");
        assert_eq!(plan.summary, "Weekly WARN sweep");
    }

    #[test]
    fn test_blueprint_rejects_forward_reference() {
        let blueprint: Vec<BlueprintStep> = serde_json::from_value(json!([
            {"agent": "marketer-agent", "params": {"input_source": "notices"}},
            {"agent": "scout-warn", "outputKey": "notices"}
        ]))
        .unwrap();
        assert!(matches!(
            plan_from_blueprint("Backwards", &blueprint),
            Err(MissionError::MalformedPlan(_))
        ));
    }

    #[test]
    fn test_validate_rejects_gap_and_duplicate_keys() {
        let brief = rules::extract("tech layoffs in california");
        let mut gapped = plan(&brief).unwrap();
        gapped.steps[1].step = 3;
        assert!(matches!(gapped.validate(), Err(MissionError::MalformedPlan(_))));

        let mut duplicated = plan(&brief).unwrap();
        duplicated.steps[1].output_key = "warn_notices".to_string();
        assert!(matches!(
            duplicated.validate(),
            Err(MissionError::MalformedPlan(_))
        ));
    }
}
