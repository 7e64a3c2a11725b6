//! Load balancing strategies
//!
//! All strategies honor warmup weighting: a provider's effective weight
//! ramps linearly from its start timestamp over the `warmup` window
//! (default ten minutes), so a freshly started endpoint is not flooded.

use dashmap::DashMap;
use mizzen_core::constants::{
    DEFAULT_HASH_NODES, DEFAULT_WARMUP_MS, DEFAULT_WEIGHT, HASH_ARGUMENTS_KEY, HASH_NODES_KEY,
    TIMESTAMP_KEY, WARMUP_KEY, WEIGHT_KEY,
};
use mizzen_core::extension::ExtensionRegistry;
use mizzen_core::{Error, Result, Url};
use mizzen_rpc::{Invoker, RpcInvocation, RpcStatus};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Picks one invoker out of the candidate list for an invocation
pub trait LoadBalance: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &RpcInvocation,
    ) -> Result<Arc<dyn Invoker>>;
}

/// Registry type for load balancers
pub type LoadBalanceRegistry = ExtensionRegistry<dyn LoadBalance>;

/// A fresh registry with the built-in strategies, defaulting to `random`
pub fn builtin_registry() -> Arc<LoadBalanceRegistry> {
    let registry = Arc::new(LoadBalanceRegistry::with_default("LoadBalance", "random"));
    registry.register("random", || Arc::new(RandomLoadBalance));
    registry.register("roundrobin", || Arc::new(RoundRobinLoadBalance::new()));
    registry.register("leastactive", || Arc::new(LeastActiveLoadBalance));
    registry.register("consistenthash", || Arc::new(ConsistentHashLoadBalance::new()));
    registry
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Effective weight after warmup scaling
pub fn weight_of(invoker: &Arc<dyn Invoker>, invocation: &RpcInvocation) -> u32 {
    let url = invoker.url();
    let weight = url.method_param_u32(invocation.method(), WEIGHT_KEY, DEFAULT_WEIGHT);
    if weight == 0 {
        return 0;
    }
    let Some(timestamp) = url.param(TIMESTAMP_KEY).and_then(|t| t.parse::<u64>().ok()) else {
        return weight;
    };
    let uptime = now_epoch_ms().saturating_sub(timestamp);
    let warmup = url.param_u64(WARMUP_KEY, DEFAULT_WARMUP_MS);
    if uptime > 0 && uptime < warmup {
        let scaled = ((uptime as f64 / warmup as f64) * weight as f64) as u32;
        scaled.clamp(1, weight)
    } else {
        weight
    }
}

fn ensure_candidates(invokers: &[Arc<dyn Invoker>]) -> Result<()> {
    if invokers.is_empty() {
        return Err(Error::Forbidden("no invoker available for selection".into()));
    }
    Ok(())
}

/// Weighted random; uniform over the list when all weights are equal
pub struct RandomLoadBalance;

impl LoadBalance for RandomLoadBalance {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        _url: &Url,
        invocation: &RpcInvocation,
    ) -> Result<Arc<dyn Invoker>> {
        ensure_candidates(invokers)?;
        if invokers.len() == 1 {
            return Ok(invokers[0].clone());
        }
        let weights: Vec<u32> = invokers.iter().map(|i| weight_of(i, invocation)).collect();
        let total: u64 = weights.iter().map(|w| *w as u64).sum();
        let same = weights.windows(2).all(|w| w[0] == w[1]);
        let mut rng = rand::thread_rng();
        if total > 0 && !same {
            let mut offset = rng.gen_range(0..total);
            for (index, weight) in weights.iter().enumerate() {
                let weight = *weight as u64;
                if offset < weight {
                    return Ok(invokers[index].clone());
                }
                offset -= weight;
            }
        }
        Ok(invokers[rng.gen_range(0..invokers.len())].clone())
    }
}

struct SmoothEntry {
    weight: u32,
    current: i64,
}

/// Smooth weighted round robin: each pick raises every candidate by its
/// weight, takes the max, and pulls the winner back down by the total
pub struct RoundRobinLoadBalance {
    state: Mutex<HashMap<String, HashMap<String, SmoothEntry>>>,
}

impl RoundRobinLoadBalance {
    pub fn new() -> Self {
        Self { state: Mutex::new(HashMap::new()) }
    }
}

impl Default for RoundRobinLoadBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalance for RoundRobinLoadBalance {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        _url: &Url,
        invocation: &RpcInvocation,
    ) -> Result<Arc<dyn Invoker>> {
        ensure_candidates(invokers)?;
        let group_key = format!(
            "{}.{}",
            invokers[0].url().service_key(),
            invocation.method()
        );
        let mut state = self.state.lock();
        let entries = state.entry(group_key).or_default();

        let keys: Vec<String> = invokers
            .iter()
            .map(|i| i.url().to_full_string().to_string())
            .collect();
        entries.retain(|k, _| keys.contains(k));

        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;
        for (index, invoker) in invokers.iter().enumerate() {
            let weight = weight_of(invoker, invocation);
            let entry = entries
                .entry(keys[index].clone())
                .or_insert(SmoothEntry { weight, current: 0 });
            entry.weight = weight;
            entry.current += weight as i64;
            total += weight as i64;
            // ties break toward the earlier invoker in list order
            if best.map(|(_, current)| entry.current > current).unwrap_or(true) {
                best = Some((index, entry.current));
            }
        }
        let index = best.map(|(index, _)| index).unwrap_or(0);
        if let Some(entry) = entries.get_mut(&keys[index]) {
            entry.current -= total;
        }
        Ok(invokers[index].clone())
    }
}

/// Prefer the invoker with the fewest in-flight calls; ties resolve by
/// weighted random among the minima, uniformly when weights agree
pub struct LeastActiveLoadBalance;

impl LoadBalance for LeastActiveLoadBalance {
    fn name(&self) -> &'static str {
        "leastactive"
    }

    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        _url: &Url,
        invocation: &RpcInvocation,
    ) -> Result<Arc<dyn Invoker>> {
        ensure_candidates(invokers)?;
        let method = invocation.method();

        let mut least_active: Option<u32> = None;
        let mut least_indexes: Vec<usize> = Vec::new();
        let mut total_weight: u64 = 0;
        let mut first_weight: u32 = 0;
        let mut same_weight = true;

        for (index, invoker) in invokers.iter().enumerate() {
            let active = RpcStatus::of(invoker.url(), method).active();
            let weight = weight_of(invoker, invocation);
            match least_active {
                None => {
                    least_active = Some(active);
                    least_indexes.clear();
                    least_indexes.push(index);
                    total_weight = weight as u64;
                    first_weight = weight;
                    same_weight = true;
                }
                Some(current) if active < current => {
                    least_active = Some(active);
                    least_indexes.clear();
                    least_indexes.push(index);
                    total_weight = weight as u64;
                    first_weight = weight;
                    same_weight = true;
                }
                Some(current) if active == current => {
                    least_indexes.push(index);
                    total_weight += weight as u64;
                    if same_weight && weight != first_weight {
                        same_weight = false;
                    }
                }
                _ => {}
            }
        }

        if least_indexes.len() == 1 {
            return Ok(invokers[least_indexes[0]].clone());
        }
        let mut rng = rand::thread_rng();
        if !same_weight && total_weight > 0 {
            let mut offset = rng.gen_range(0..total_weight);
            for &index in &least_indexes {
                let weight = weight_of(&invokers[index], invocation) as u64;
                if offset < weight {
                    return Ok(invokers[index].clone());
                }
                offset -= weight;
            }
        }
        Ok(invokers[least_indexes[rng.gen_range(0..least_indexes.len())]].clone())
    }
}

struct HashSelector {
    invokers: Vec<Arc<dyn Invoker>>,
    ring: BTreeMap<u64, usize>,
    identity: u64,
    argument_indexes: Vec<usize>,
}

impl HashSelector {
    fn build(
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        identity: u64,
    ) -> Self {
        let replicas = url.param_usize(HASH_NODES_KEY, DEFAULT_HASH_NODES);
        let argument_indexes: Vec<usize> = url
            .param_or(HASH_ARGUMENTS_KEY, "0")
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        let mut ring = BTreeMap::new();
        for (index, invoker) in invokers.iter().enumerate() {
            let address = invoker.url().address();
            for group in 0..replicas / 4 {
                let digest = md5::compute(format!("{}{}", address, group));
                for slot in 0..4 {
                    ring.insert(hash_slot(&digest.0, slot), index);
                }
            }
        }
        Self {
            invokers: invokers.to_vec(),
            ring,
            identity,
            argument_indexes,
        }
    }

    fn select(&self, invocation: &RpcInvocation) -> Arc<dyn Invoker> {
        let mut key = Vec::new();
        for &index in &self.argument_indexes {
            if let Some(argument) = invocation.arguments().get(index) {
                key.extend_from_slice(argument);
            }
        }
        let digest = md5::compute(&key);
        let hash = hash_slot(&digest.0, 0);
        // ceiling entry on the ring, wrapping to the first node
        let index = self
            .ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &i)| i)
            .unwrap_or(0);
        self.invokers[index].clone()
    }
}

fn hash_slot(digest: &[u8; 16], slot: usize) -> u64 {
    ((digest[3 + slot * 4] as u64) << 24)
        | ((digest[2 + slot * 4] as u64) << 16)
        | ((digest[1 + slot * 4] as u64) << 8)
        | (digest[slot * 4] as u64)
}

/// Consistent hashing over 160 virtual nodes per invoker; requests with the
/// same key always land on the same provider while it lives
pub struct ConsistentHashLoadBalance {
    selectors: DashMap<String, Arc<HashSelector>>,
}

impl ConsistentHashLoadBalance {
    pub fn new() -> Self {
        Self { selectors: DashMap::new() }
    }
}

impl Default for ConsistentHashLoadBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalance for ConsistentHashLoadBalance {
    fn name(&self) -> &'static str {
        "consistenthash"
    }

    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &RpcInvocation,
    ) -> Result<Arc<dyn Invoker>> {
        ensure_candidates(invokers)?;
        let group_key = format!(
            "{}.{}",
            invokers[0].url().service_key(),
            invocation.method()
        );
        let mut hasher = DefaultHasher::new();
        for invoker in invokers {
            invoker.url().to_full_string().hash(&mut hasher);
        }
        let identity = hasher.finish();

        // drop the read guard before a possible insert into the same shard
        let cached = self
            .selectors
            .get(&group_key)
            .filter(|existing| existing.identity == identity)
            .map(|existing| existing.value().clone());
        let selector = match cached {
            Some(existing) => existing,
            None => {
                let built = Arc::new(HashSelector::build(invokers, url, identity));
                self.selectors.insert(group_key, built.clone());
                built
            }
        };
        Ok(selector.select(invocation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mizzen_rpc::RpcResult;

    struct Stub {
        url: Url,
    }

    #[async_trait]
    impl Invoker for Stub {
        fn url(&self) -> &Url {
            &self.url
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(&self, _invocation: RpcInvocation) -> Result<RpcResult> {
            Ok(RpcResult::null())
        }

        fn destroy(&self) {}
    }

    fn invoker(host: &str, weight: u32) -> Arc<dyn Invoker> {
        Arc::new(Stub {
            url: Url::new("mizzen", host, 20880, "org.demo.Lb").with_param(WEIGHT_KEY, weight),
        })
    }

    fn consumer_url() -> Url {
        Url::new("consumer", "127.0.0.1", 0, "org.demo.Lb")
    }

    #[test]
    fn random_respects_zero_weight() {
        let invokers = vec![invoker("10.0.0.1", 0), invoker("10.0.0.2", 100)];
        let lb = RandomLoadBalance;
        for _ in 0..50 {
            let picked = lb
                .select(&invokers, &consumer_url(), &RpcInvocation::new("m"))
                .unwrap();
            assert_eq!(picked.url().host(), "10.0.0.2");
        }
    }

    #[test]
    fn round_robin_distributes_by_weight() {
        let invokers = vec![invoker("10.0.0.1", 300), invoker("10.0.0.2", 100)];
        let lb = RoundRobinLoadBalance::new();
        let mut counts = HashMap::new();
        for _ in 0..400 {
            let picked = lb
                .select(&invokers, &consumer_url(), &RpcInvocation::new("m"))
                .unwrap();
            *counts.entry(picked.url().host().to_string()).or_insert(0) += 1;
        }
        assert_eq!(counts["10.0.0.1"], 300);
        assert_eq!(counts["10.0.0.2"], 100);
    }

    #[test]
    fn round_robin_is_smooth() {
        // weights 3:1 must not produce long runs of the heavy node
        let invokers = vec![invoker("10.0.0.1", 3), invoker("10.0.0.2", 1)];
        let lb = RoundRobinLoadBalance::new();
        let picks: Vec<String> = (0..8)
            .map(|_| {
                lb.select(&invokers, &consumer_url(), &RpcInvocation::new("m"))
                    .unwrap()
                    .url()
                    .host()
                    .to_string()
            })
            .collect();
        let light_positions: Vec<usize> = picks
            .iter()
            .enumerate()
            .filter(|(_, h)| h.as_str() == "10.0.0.2")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(light_positions.len(), 2);
        // the light node appears once per cycle of four, not bunched at the end
        assert!(light_positions[1] - light_positions[0] == 4);
    }

    #[test]
    fn least_active_is_deterministic_for_single_minimum() {
        let a = invoker("10.0.0.1", 100);
        let b = invoker("10.0.0.2", 100);
        // one in-flight call on b
        let busy = RpcStatus::begin_count(b.url(), "m");

        let lb = LeastActiveLoadBalance;
        let invokers = vec![a, b];
        for _ in 0..1000 {
            let picked = lb
                .select(&invokers, &consumer_url(), &RpcInvocation::new("m"))
                .unwrap();
            assert_eq!(picked.url().host(), "10.0.0.1");
        }
        busy.end_count(std::time::Duration::from_millis(1), true);
    }

    #[test]
    fn consistent_hash_is_stable_under_unrelated_removal() {
        let invocation = RpcInvocation::new("m").with_arguments(vec![b"k".to_vec()]);
        let url = consumer_url().with_param(HASH_ARGUMENTS_KEY, "0");
        let lb = ConsistentHashLoadBalance::new();

        let full: Vec<Arc<dyn Invoker>> = (1..=4)
            .map(|i| invoker(&format!("10.0.0.{}", i), 100))
            .collect();
        let chosen = lb.select(&full, &url, &invocation).unwrap();
        let chosen_host = chosen.url().host().to_string();

        // remove a provider that is not the chosen one
        let unrelated = full
            .iter()
            .find(|i| i.url().host() != chosen_host)
            .unwrap()
            .url()
            .host()
            .to_string();
        let reduced: Vec<Arc<dyn Invoker>> = full
            .iter()
            .filter(|i| i.url().host() != unrelated)
            .cloned()
            .collect();

        let again = lb.select(&reduced, &url, &invocation).unwrap();
        assert_eq!(again.url().host(), chosen_host);
    }

    #[test]
    fn consistent_hash_same_key_same_node() {
        let invocation = RpcInvocation::new("m").with_arguments(vec![b"stable-key".to_vec()]);
        let url = consumer_url();
        let lb = ConsistentHashLoadBalance::new();
        let invokers: Vec<Arc<dyn Invoker>> = (1..=4)
            .map(|i| invoker(&format!("10.0.0.{}", i), 100))
            .collect();
        let first = lb.select(&invokers, &url, &invocation).unwrap();
        for _ in 0..20 {
            let next = lb.select(&invokers, &url, &invocation).unwrap();
            assert_eq!(next.url().host(), first.url().host());
        }
    }

    #[test]
    fn warmup_scales_weight() {
        let now = now_epoch_ms();
        let cold = Arc::new(Stub {
            url: Url::new("mizzen", "10.0.0.1", 20880, "s")
                .with_param(WEIGHT_KEY, 100)
                .with_param(WARMUP_KEY, 600_000u64)
                .with_param(TIMESTAMP_KEY, now.saturating_sub(60_000)),
        }) as Arc<dyn Invoker>;
        let weight = weight_of(&cold, &RpcInvocation::new("m"));
        // one minute into a ten minute warmup: about a tenth of the weight
        assert!((5..=15).contains(&weight), "weight was {}", weight);

        let warm = Arc::new(Stub {
            url: Url::new("mizzen", "10.0.0.1", 20880, "s")
                .with_param(WEIGHT_KEY, 100)
                .with_param(TIMESTAMP_KEY, now.saturating_sub(3_600_000)),
        }) as Arc<dyn Invoker>;
        assert_eq!(weight_of(&warm, &RpcInvocation::new("m")), 100);
    }
}
