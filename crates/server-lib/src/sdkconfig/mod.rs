//! Remote configuration documents
//!
//! This module provides:
//! - The SDK and instrumentation-library value objects and their JSON wire form
//! - Server-resolved resource attributes
//! - A computer that derives full configs and per-section updates from cluster state

mod attributes;
mod computer;
mod sections;

pub use attributes::{server_resource_attributes, with_service_name, SERVICE_NAME};
pub use computer::{FullConfig, RemoteConfigComputer};
pub use sections::{
    calc_libraries_config, calc_sdk_config, libraries_section, sdk_section, to_wire_sections,
    RemoteConfigInstrumentationLibrary, RemoteConfigInstrumentationLibraryTraces,
    RemoteConfigSdk, RemoteConfigSignal, CONTENT_TYPE_JSON, DEFAULT_ENABLED_VALUE,
    LIBRARIES_SECTION_NAME, SDK_SECTION_NAME,
};
