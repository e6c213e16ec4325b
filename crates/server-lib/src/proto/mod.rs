//! Protobuf messages
//!
//! Two wire protocols are spoken here:
//! - the OpAMP request/response envelope exchanged with instrumented agents
//! - the kubelet `PodResourcesLister` API used to map device ids to containers
//!
//! Only the fields this server reads or writes are declared; unknown fields
//! on the wire are skipped by prost when decoding.

pub mod opamp {
    use prost::Message;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Clone, PartialEq, Message)]
    pub struct AgentToServer {
        #[prost(bytes = "vec", tag = "1")]
        pub instance_uid: Vec<u8>,
        #[prost(uint64, tag = "2")]
        pub sequence_num: u64,
        #[prost(message, optional, tag = "3")]
        pub agent_description: Option<AgentDescription>,
        #[prost(uint64, tag = "4")]
        pub capabilities: u64,
        #[prost(message, optional, tag = "5")]
        pub health: Option<ComponentHealth>,
        #[prost(message, optional, tag = "7")]
        pub remote_config_status: Option<RemoteConfigStatus>,
        #[prost(message, optional, tag = "9")]
        pub agent_disconnect: Option<AgentDisconnect>,
        #[prost(uint64, tag = "10")]
        pub flags: u64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ServerToAgent {
        #[prost(bytes = "vec", tag = "1")]
        pub instance_uid: Vec<u8>,
        #[prost(message, optional, tag = "3")]
        pub remote_config: Option<AgentRemoteConfig>,
        #[prost(uint64, tag = "6")]
        pub flags: u64,
        #[prost(uint64, tag = "7")]
        pub capabilities: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    #[repr(u64)]
    pub enum ServerToAgentFlags {
        #[default]
        Unspecified = 0,
        ReportFullState = 1,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AgentDescription {
        #[prost(message, repeated, tag = "1")]
        pub identifying_attributes: Vec<KeyValue>,
        #[prost(message, repeated, tag = "2")]
        pub non_identifying_attributes: Vec<KeyValue>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct KeyValue {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(message, optional, tag = "2")]
        pub value: Option<AnyValue>,
    }

    impl KeyValue {
        pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
            Self {
                key: key.into(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::StringValue(value.into())),
                }),
            }
        }

        pub fn int(key: impl Into<String>, value: i64) -> Self {
            Self {
                key: key.into(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::IntValue(value)),
                }),
            }
        }
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AnyValue {
        #[prost(oneof = "any_value::Value", tags = "1, 2, 3, 4, 7")]
        pub value: Option<any_value::Value>,
    }

    pub mod any_value {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Value {
            #[prost(string, tag = "1")]
            StringValue(String),
            #[prost(bool, tag = "2")]
            BoolValue(bool),
            #[prost(int64, tag = "3")]
            IntValue(i64),
            #[prost(double, tag = "4")]
            DoubleValue(f64),
            #[prost(bytes = "vec", tag = "7")]
            BytesValue(Vec<u8>),
        }
    }

    impl AnyValue {
        pub fn as_int(&self) -> Option<i64> {
            match &self.value {
                Some(any_value::Value::IntValue(v)) => Some(*v),
                _ => None,
            }
        }

        pub fn as_str(&self) -> Option<&str> {
            match &self.value {
                Some(any_value::Value::StringValue(v)) => Some(v.as_str()),
                _ => None,
            }
        }

        /// Render any scalar value as a string
        pub fn to_display_string(&self) -> String {
            match &self.value {
                Some(any_value::Value::StringValue(v)) => v.clone(),
                Some(any_value::Value::BoolValue(v)) => v.to_string(),
                Some(any_value::Value::IntValue(v)) => v.to_string(),
                Some(any_value::Value::DoubleValue(v)) => v.to_string(),
                Some(any_value::Value::BytesValue(v)) => hex::encode(v),
                None => String::new(),
            }
        }
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ComponentHealth {
        #[prost(bool, tag = "1")]
        pub healthy: bool,
        #[prost(fixed64, tag = "2")]
        pub start_time_unix_nano: u64,
        #[prost(string, tag = "3")]
        pub last_error: String,
        #[prost(string, tag = "4")]
        pub status: String,
        #[prost(fixed64, tag = "5")]
        pub status_time_unix_nano: u64,
        #[prost(map = "string, message", tag = "6")]
        pub component_health_map: HashMap<String, ComponentHealth>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct RemoteConfigStatus {
        #[prost(bytes = "vec", tag = "1")]
        pub last_remote_config_hash: Vec<u8>,
        #[prost(int32, tag = "2")]
        pub status: i32,
        #[prost(string, tag = "3")]
        pub error_message: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AgentDisconnect {}

    #[derive(Clone, PartialEq, Message)]
    pub struct AgentRemoteConfig {
        #[prost(message, optional, tag = "1")]
        pub config: Option<AgentConfigMap>,
        #[prost(bytes = "vec", tag = "2")]
        pub config_hash: Vec<u8>,
    }

    /// Sections are kept sorted by name so iteration order is deterministic.
    #[derive(Clone, PartialEq, Message)]
    pub struct AgentConfigMap {
        #[prost(btree_map = "string, message", tag = "1")]
        pub config_map: BTreeMap<String, AgentConfigFile>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AgentConfigFile {
        #[prost(bytes = "vec", tag = "1")]
        pub body: Vec<u8>,
        #[prost(string, tag = "2")]
        pub content_type: String,
    }
}

pub mod podresources {
    pub mod v1 {
        use prost::Message;

        #[derive(Clone, PartialEq, Message)]
        pub struct ListPodResourcesRequest {}

        #[derive(Clone, PartialEq, Message)]
        pub struct ListPodResourcesResponse {
            #[prost(message, repeated, tag = "1")]
            pub pod_resources: Vec<PodResources>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PodResources {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(string, tag = "2")]
            pub namespace: String,
            #[prost(message, repeated, tag = "3")]
            pub containers: Vec<ContainerResources>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerResources {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(message, repeated, tag = "2")]
            pub devices: Vec<ContainerDevices>,
            #[prost(int64, repeated, tag = "3")]
            pub cpu_ids: Vec<i64>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerDevices {
            #[prost(string, tag = "1")]
            pub resource_name: String,
            #[prost(string, repeated, tag = "2")]
            pub device_ids: Vec<String>,
        }

        pub mod pod_resources_lister_client {
            use super::*;
            use tonic::codegen::*;

            #[derive(Debug, Clone)]
            pub struct PodResourcesListerClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl PodResourcesListerClient<tonic::transport::Channel> {
                pub fn new(channel: tonic::transport::Channel) -> Self {
                    let inner = tonic::client::Grpc::new(channel);
                    Self { inner }
                }
            }

            impl<T> PodResourcesListerClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                pub async fn list(
                    &mut self,
                    request: impl tonic::IntoRequest<ListPodResourcesRequest>,
                ) -> Result<tonic::Response<ListPodResourcesResponse>, tonic::Status> {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static("/v1.PodResourcesLister/List");
                    self.inner.unary(request.into_request(), path, codec).await
                }
            }
        }
    }
}

pub use opamp::*;
pub use podresources::v1::pod_resources_lister_client::PodResourcesListerClient;
