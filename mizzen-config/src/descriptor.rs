//! Service and reference descriptors
//!
//! The inbound configuration surface: everything an export or a reference
//! needs, already parsed. Configuration file formats live outside the
//! framework; callers construct descriptors with the builder methods.

use mizzen_core::Url;
use std::collections::BTreeMap;

/// Where a service is made callable from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Export nowhere (dry configuration)
    None,
    /// In-process only
    Local,
    /// Network only
    Remote,
    /// Both in-process and network
    Both,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Both
    }
}

/// Per-method policy overrides
#[derive(Debug, Clone, Default)]
pub struct MethodDescriptor {
    pub name: String,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub oneway: bool,
    pub actives: Option<u32>,
    pub executes: Option<u32>,
    pub sticky: Option<bool>,
}

impl MethodDescriptor {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn oneway(mut self) -> Self {
        self.oneway = true;
        self
    }
}

/// One protocol a service is exported over
#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
    pub name: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub threadpool: Option<String>,
    pub threads: Option<usize>,
    pub queues: Option<usize>,
    pub dispatcher: Option<String>,
    pub payload: Option<usize>,
    pub serialization: Option<String>,
    pub heartbeat_ms: Option<u64>,
}

impl ProtocolDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: None,
            port: None,
            threadpool: None,
            threads: None,
            queues: None,
            dispatcher: None,
            payload: None,
            serialization: None,
            heartbeat_ms: None,
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_serialization(mut self, serialization: &str) -> Self {
        self.serialization = Some(serialization.to_string());
        self
    }
}

/// Everything needed to export one service
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub interface: String,
    pub application: String,
    pub group: Option<String>,
    pub version: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub weight: Option<u32>,
    pub token: Option<String>,
    pub scope: Scope,
    pub methods: Vec<MethodDescriptor>,
    pub registries: Vec<Url>,
    pub protocols: Vec<ProtocolDescriptor>,
    pub parameters: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(interface: &str, application: &str) -> Self {
        Self {
            interface: interface.to_string(),
            application: application.to_string(),
            group: None,
            version: None,
            timeout_ms: None,
            retries: None,
            weight: None,
            token: None,
            scope: Scope::default(),
            methods: Vec::new(),
            registries: Vec::new(),
            protocols: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_registry(mut self, registry: Url) -> Self {
        self.registries.push(registry);
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolDescriptor) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn with_parameter(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }
}

/// Everything needed to reference one service
#[derive(Debug, Clone)]
pub struct ReferenceDescriptor {
    pub interface: String,
    pub application: String,
    pub group: Option<String>,
    pub version: Option<String>,
    pub cluster: Option<String>,
    pub loadbalance: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub check: bool,
    pub sticky: bool,
    pub methods: Vec<MethodDescriptor>,
    pub registries: Vec<Url>,
    /// Bypass the registry entirely and talk to this endpoint
    pub direct_url: Option<Url>,
    pub parameters: BTreeMap<String, String>,
}

impl ReferenceDescriptor {
    pub fn new(interface: &str, application: &str) -> Self {
        Self {
            interface: interface.to_string(),
            application: application.to_string(),
            group: None,
            version: None,
            cluster: None,
            loadbalance: None,
            timeout_ms: None,
            retries: None,
            check: true,
            sticky: false,
            methods: Vec::new(),
            registries: Vec::new(),
            direct_url: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    pub fn with_loadbalance(mut self, loadbalance: &str) -> Self {
        self.loadbalance = Some(loadbalance.to_string());
        self
    }

    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn with_registry(mut self, registry: Url) -> Self {
        self.registries.push(registry);
        self
    }

    pub fn with_direct_url(mut self, url: Url) -> Self {
        self.direct_url = Some(url);
        self
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_parameter(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }
}
