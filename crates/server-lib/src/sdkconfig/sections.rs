//! Remote config value objects and their wire sections

use crate::crd::InstrumentationConfig;
use crate::error::ConfigError;
use crate::models::{null_as_empty, EnabledSignals, ResourceAttribute};
use crate::proto::AgentConfigFile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Section carrying [`RemoteConfigSdk`]
pub const SDK_SECTION_NAME: &str = "SDK";

/// Section carrying the list of [`RemoteConfigInstrumentationLibrary`]
pub const LIBRARIES_SECTION_NAME: &str = "InstrumentationLibraries";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Applies to libraries with no explicit setting
pub const DEFAULT_ENABLED_VALUE: bool = true;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfigSignal {
    pub enabled: bool,
    pub default_enabled_value: bool,
}

impl RemoteConfigSignal {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            default_enabled_value: DEFAULT_ENABLED_VALUE,
        }
    }
}

/// Process-wide SDK settings pushed to an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfigSdk {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub remote_resource_attributes: Vec<ResourceAttribute>,
    pub trace_signal: RemoteConfigSignal,
    pub logs_signal: RemoteConfigSignal,
    pub metrics_signal: RemoteConfigSignal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfigInstrumentationLibraryTraces {
    /// Unset means the signal's default applies
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfigInstrumentationLibrary {
    pub name: String,
    #[serde(default)]
    pub traces: RemoteConfigInstrumentationLibraryTraces,
}

pub fn calc_sdk_config(
    resource_attributes: &[ResourceAttribute],
    signals: EnabledSignals,
) -> RemoteConfigSdk {
    RemoteConfigSdk {
        remote_resource_attributes: resource_attributes.to_vec(),
        trace_signal: RemoteConfigSignal::new(signals.traces),
        logs_signal: RemoteConfigSignal::new(signals.logs),
        metrics_signal: RemoteConfigSignal::new(signals.metrics),
    }
}

/// One entry per library configured for `language`.
///
/// No config, no sdk config for the language, and entries without a
/// library name all yield nothing rather than an error.
pub fn calc_libraries_config(
    config: Option<&InstrumentationConfig>,
    language: &str,
) -> Vec<RemoteConfigInstrumentationLibrary> {
    let Some(sdk) = config.and_then(|c| c.spec.sdk_config_for(language)) else {
        return Vec::new();
    };

    sdk.instrumentation_library_configs
        .iter()
        .filter(|lib| !lib.library_id.library_name.is_empty())
        .map(|lib| RemoteConfigInstrumentationLibrary {
            name: lib.library_id.library_name.clone(),
            traces: RemoteConfigInstrumentationLibraryTraces {
                enabled: lib.trace_config.as_ref().and_then(|t| t.enabled),
            },
        })
        .collect()
}

fn json_section<T: Serialize>(
    section: &'static str,
    value: &T,
) -> Result<AgentConfigFile, ConfigError> {
    let body =
        serde_json::to_vec(value).map_err(|source| ConfigError::Serialization { section, source })?;
    Ok(AgentConfigFile {
        body,
        content_type: CONTENT_TYPE_JSON.to_string(),
    })
}

pub fn sdk_section(sdk: &RemoteConfigSdk) -> Result<(String, AgentConfigFile), ConfigError> {
    Ok((SDK_SECTION_NAME.to_string(), json_section(SDK_SECTION_NAME, sdk)?))
}

pub fn libraries_section(
    libraries: &[RemoteConfigInstrumentationLibrary],
) -> Result<(String, AgentConfigFile), ConfigError> {
    Ok((
        LIBRARIES_SECTION_NAME.to_string(),
        json_section(LIBRARIES_SECTION_NAME, &libraries)?,
    ))
}

/// Both sections keyed by name, ready to merge into a config map
pub fn to_wire_sections(
    sdk: &RemoteConfigSdk,
    libraries: &[RemoteConfigInstrumentationLibrary],
) -> Result<BTreeMap<String, AgentConfigFile>, ConfigError> {
    Ok(BTreeMap::from([sdk_section(sdk)?, libraries_section(libraries)?]))
}
