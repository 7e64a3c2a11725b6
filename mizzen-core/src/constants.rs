//! Well-known URL parameter keys and framework defaults

pub const GROUP_KEY: &str = "group";
pub const VERSION_KEY: &str = "version";
pub const INTERFACE_KEY: &str = "interface";
pub const CATEGORY_KEY: &str = "category";
pub const DYNAMIC_KEY: &str = "dynamic";
pub const CHECK_KEY: &str = "check";
pub const ENABLED_KEY: &str = "enabled";
pub const SIDE_KEY: &str = "side";
pub const TIMEOUT_KEY: &str = "timeout";
pub const RETRIES_KEY: &str = "retries";
pub const WEIGHT_KEY: &str = "weight";
pub const WARMUP_KEY: &str = "warmup";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const CLUSTER_KEY: &str = "cluster";
pub const LOADBALANCE_KEY: &str = "loadbalance";
pub const STICKY_KEY: &str = "sticky";
pub const FORKS_KEY: &str = "forks";
pub const METHODS_KEY: &str = "methods";
pub const APPLICATION_KEY: &str = "application";
pub const TOKEN_KEY: &str = "token";
pub const ACTIVES_KEY: &str = "actives";
pub const EXECUTES_KEY: &str = "executes";
pub const TPS_LIMIT_RATE_KEY: &str = "tps";
pub const TPS_LIMIT_INTERVAL_KEY: &str = "tps.interval";
pub const ACCESS_LOG_KEY: &str = "accesslog";
pub const ONEWAY_KEY: &str = "oneway";
pub const SERIALIZATION_KEY: &str = "serialization";
pub const HEARTBEAT_KEY: &str = "heartbeat";
pub const PAYLOAD_KEY: &str = "payload";
pub const THREADPOOL_KEY: &str = "threadpool";
pub const THREADS_KEY: &str = "threads";
pub const CORE_THREADS_KEY: &str = "corethreads";
pub const QUEUES_KEY: &str = "queues";
pub const DISPATCHER_KEY: &str = "dispatcher";
pub const HASH_ARGUMENTS_KEY: &str = "hash.arguments";
pub const HASH_NODES_KEY: &str = "hash.nodes";
pub const RETRY_PERIOD_KEY: &str = "retry.period";
pub const FILTER_KEY: &str = "filter";
pub const SERVICE_FILTER_KEY: &str = "service.filter";
pub const REFERENCE_FILTER_KEY: &str = "reference.filter";
pub const EXPORT_KEY: &str = "export";
pub const REFER_KEY: &str = "refer";
pub const REGISTRY_KEY: &str = "registry";
pub const BACKUP_KEY: &str = "backup";
pub const TAG_KEY: &str = "tag";
pub const FORCE_USE_TAG_KEY: &str = "tag.force";
pub const RULE_KEY: &str = "rule";
pub const RUNTIME_KEY: &str = "runtime";
pub const FORCE_KEY: &str = "force";
pub const PRIORITY_KEY: &str = "priority";
pub const SCOPE_KEY: &str = "scope";
pub const PATH_KEY: &str = "path";
pub const FILE_KEY: &str = "file";

pub const SIDE_PROVIDER: &str = "provider";
pub const SIDE_CONSUMER: &str = "consumer";

pub const PROVIDERS_CATEGORY: &str = "providers";
pub const CONSUMERS_CATEGORY: &str = "consumers";
pub const ROUTERS_CATEGORY: &str = "routers";
pub const CONFIGURATORS_CATEGORY: &str = "configurators";
pub const ANY_CATEGORY: &str = "*";

/// Protocol of the placeholder URL that encodes "this category is now empty"
pub const EMPTY_PROTOCOL: &str = "empty";
pub const OVERRIDE_PROTOCOL: &str = "override";
pub const ABSENT_PROTOCOL: &str = "absent";
pub const ROUTE_PROTOCOL: &str = "condition";
pub const TAG_ROUTE_PROTOCOL: &str = "tag";
pub const REGISTRY_PROTOCOL: &str = "registry";
pub const INJVM_PROTOCOL: &str = "injvm";
pub const CONSUMER_PROTOCOL: &str = "consumer";
pub const PROVIDER_PROTOCOL: &str = "provider";

pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_WEIGHT: u32 = 100;
pub const DEFAULT_WARMUP_MS: u64 = 10 * 60 * 1_000;
pub const DEFAULT_HEARTBEAT_MS: u64 = 60_000;
pub const DEFAULT_PAYLOAD: usize = 8 * 1024 * 1024;
pub const DEFAULT_FORKS: u32 = 2;
pub const DEFAULT_RETRY_PERIOD_MS: u64 = 5_000;
pub const DEFAULT_FAILBACK_PERIOD_MS: u64 = 5_000;
pub const DEFAULT_THREADS: usize = 200;
pub const DEFAULT_CORE_THREADS: usize = 0;
pub const DEFAULT_QUEUES: usize = 0;
pub const DEFAULT_HASH_NODES: usize = 160;

/// Framework release string carried in every request body
pub const FRAMEWORK_VERSION: &str = "0.6.0";

/// Attachment keys stripped by the provider-side context filter before the
/// invocation reaches user code
pub const FRAMEWORK_ATTACHMENT_KEYS: &[&str] = &[
    PATH_ATTACHMENT_KEY,
    GROUP_KEY,
    VERSION_KEY,
    TOKEN_KEY,
    TIMEOUT_KEY,
];

pub const PATH_ATTACHMENT_KEY: &str = "path";
pub const INTERFACE_ATTACHMENT_KEY: &str = "interface";
