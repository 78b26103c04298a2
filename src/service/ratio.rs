use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use tracing::{info, warn};

use crate::database::option::load_all_options;
use crate::database::DbResult;

const DEFAULT_MODEL_RATIO: f64 = 30.0;

fn default_model_ratios() -> HashMap<String, f64> {
    // Ratio base: $0.002 / 1K tokens maps to 1.
    HashMap::from([
        ("gpt-3.5-turbo".to_string(), 0.75),
        ("gpt-3.5-turbo-0613".to_string(), 0.75),
        ("gpt-3.5-turbo-16k".to_string(), 1.5),
        ("gpt-3.5-turbo-instruct".to_string(), 0.75),
        ("gpt-4".to_string(), 15.0),
        ("gpt-4-0613".to_string(), 15.0),
        ("gpt-4-32k".to_string(), 30.0),
        ("text-embedding-ada-002".to_string(), 0.05),
        ("text-moderation-latest".to_string(), 0.1),
        ("text-moderation-stable".to_string(), 0.1),
        ("text-davinci-003".to_string(), 10.0),
        ("text-davinci-edit-001".to_string(), 10.0),
        ("claude-instant-1".to_string(), 0.815),
        ("claude-2".to_string(), 5.51),
        ("ERNIE-Bot".to_string(), 0.8572),
        ("ERNIE-Bot-turbo".to_string(), 0.5715),
        ("ERNIE-Bot-4".to_string(), 8.572),
        ("BLOOMZ-7B".to_string(), 0.8572),
        ("Embedding-V1".to_string(), 0.1429),
        ("PaLM-2".to_string(), 1.0),
        ("chatglm_pro".to_string(), 0.7143),
        ("chatglm_std".to_string(), 0.3572),
        ("chatglm_lite".to_string(), 0.1429),
        ("qwen-turbo".to_string(), 0.5715),
        ("qwen-plus".to_string(), 1.4286),
        ("text-embedding-v1".to_string(), 0.05),
        ("SparkDesk".to_string(), 1.2858),
        ("ChatStd".to_string(), 0.01),
        ("ChatPro".to_string(), 0.71),
    ])
}

static MODEL_RATIOS: Lazy<RwLock<HashMap<String, f64>>> =
    Lazy::new(|| RwLock::new(default_model_ratios()));

static GROUP_RATIOS: Lazy<RwLock<HashMap<String, f64>>> = Lazy::new(|| {
    RwLock::new(HashMap::from([
        ("default".to_string(), 1.0),
        ("vip".to_string(), 1.0),
        ("svip".to_string(), 1.0),
    ]))
});

static COMPLETION_RATIOS: Lazy<RwLock<HashMap<String, f64>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn get_model_ratio(model: &str) -> f64 {
    let ratios = MODEL_RATIOS.read().unwrap();
    match ratios.get(model) {
        Some(ratio) => *ratio,
        None => {
            warn!("model ratio not found for {}, using default", model);
            DEFAULT_MODEL_RATIO
        }
    }
}

pub fn get_group_ratio(group: &str) -> f64 {
    let ratios = GROUP_RATIOS.read().unwrap();
    *ratios.get(group).unwrap_or(&1.0)
}

/// Multiplier applied only to completion tokens. Explicit table entries win;
/// otherwise the model family decides.
pub fn get_completion_ratio(model: &str) -> f64 {
    if let Some(ratio) = COMPLETION_RATIOS.read().unwrap().get(model) {
        return *ratio;
    }
    if model.starts_with("gpt-3.5") {
        4.0 / 3.0
    } else if model.starts_with("gpt-4") {
        2.0
    } else if model.starts_with("claude-instant-1") {
        3.38
    } else if model.starts_with("claude-2") {
        2.965
    } else {
        1.0
    }
}

/// Re-reads the options table and applies the ratio tables it carries.
/// Unknown keys are ignored; they belong to the administrative surface.
pub fn reload_options() -> DbResult<()> {
    let rows = load_all_options()?;
    for (key, value) in rows {
        match key.as_str() {
            "ModelRatio" => apply_ratio_json(&MODEL_RATIOS, &value, "ModelRatio"),
            "GroupRatio" => apply_ratio_json(&GROUP_RATIOS, &value, "GroupRatio"),
            "CompletionRatio" => apply_ratio_json(&COMPLETION_RATIOS, &value, "CompletionRatio"),
            _ => {}
        }
    }
    info!("options reloaded");
    Ok(())
}

fn apply_ratio_json(store: &RwLock<HashMap<String, f64>>, raw: &str, name: &str) {
    match serde_json::from_str::<HashMap<String, f64>>(raw) {
        Ok(parsed) => {
            let mut table = store.write().unwrap();
            table.extend(parsed);
        }
        Err(e) => warn!("ignoring malformed {} option: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ratio_default_for_unknown() {
        assert_eq!(get_model_ratio("made-up-model"), DEFAULT_MODEL_RATIO);
        assert_eq!(get_model_ratio("gpt-4"), 15.0);
    }

    #[test]
    fn test_group_ratio_defaults_to_one() {
        assert_eq!(get_group_ratio("default"), 1.0);
        assert_eq!(get_group_ratio("unknown-tier"), 1.0);
    }

    #[test]
    fn test_completion_ratio_families() {
        assert!((get_completion_ratio("gpt-3.5-turbo") - 4.0 / 3.0).abs() < 1e-9);
        assert_eq!(get_completion_ratio("gpt-4-0613"), 2.0);
        assert_eq!(get_completion_ratio("ERNIE-Bot"), 1.0);
    }

    #[test]
    fn test_apply_ratio_json_merges() {
        apply_ratio_json(&MODEL_RATIOS, r#"{"my-model": 2.5}"#, "ModelRatio");
        assert_eq!(get_model_ratio("my-model"), 2.5);
        // Existing entries survive a partial override.
        assert_eq!(get_model_ratio("gpt-4"), 15.0);
    }
}
