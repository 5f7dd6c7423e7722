//! Provider selection: filters plus a pluggable pick strategy.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;

use quillrpc_common::metadata::{MetaValue, PINNED_PROVIDER_KEY, TAGS_KEY};
use quillrpc_common::{Context, Result, RpcError};
use quillrpc_registry::Provider;

/// A filter keeps (`true`) or drops (`false`) a provider. Filters in
/// [`SelectOptions`] are AND-combined.
pub type Filter = Arc<dyn Fn(&Context, &Provider, &str) -> bool + Send + Sync>;

/// Excludes providers flagged by the heartbeat loop as degraded.
pub fn degrade_filter() -> Filter {
    Arc::new(|_ctx, provider, _service_method| !provider.is_degraded())
}

/// Keeps only providers whose advertised tags carry every requested
/// key/value pair. Providers advertising no tags are dropped.
pub fn tag_filter(tags: std::collections::HashMap<String, String>) -> Filter {
    Arc::new(move |_ctx, provider, _service_method| {
        if tags.is_empty() {
            return true;
        }
        let Some(provider_tags) = provider.meta.get(TAGS_KEY).and_then(MetaValue::as_map) else {
            return false;
        };
        tags.iter().all(|(key, want)| {
            provider_tags
                .get(key)
                .and_then(MetaValue::as_str)
                .is_some_and(|have| have == want)
        })
    })
}

#[derive(Clone, Default)]
pub struct SelectOptions {
    pub filters: Vec<Filter>,
}

impl SelectOptions {
    fn apply<'a>(
        &self,
        ctx: &Context,
        providers: &'a [Provider],
        service_method: &str,
    ) -> Vec<&'a Provider> {
        providers
            .iter()
            .filter(|p| self.filters.iter().all(|f| f(ctx, p, service_method)))
            .collect()
    }
}

/// Picks one provider from the filtered candidate list.
pub trait Selector: Send + Sync {
    fn next(
        &self,
        ctx: &Context,
        providers: &[Provider],
        service_method: &str,
        options: &SelectOptions,
    ) -> Result<Provider>;
}

/// Uniform random pick.
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn next(
        &self,
        ctx: &Context,
        providers: &[Provider],
        service_method: &str,
        options: &SelectOptions,
    ) -> Result<Provider> {
        let list = options.apply(ctx, providers, service_method);
        if list.is_empty() {
            return Err(RpcError::EmptyProviderList);
        }
        let idx = rand::thread_rng().gen_range(0..list.len());
        Ok(list[idx].clone())
    }
}

/// The hook deriving the hash key for a call.
pub type KeyOf = Arc<dyn Fn(&Context, &str) -> String + Send + Sync>;

/// Consistent hashing over a CRC32 virtual-node ring.
///
/// The ring is rebuilt from the filtered candidates on every pick, so
/// provider churn never leaves stale nodes behind. With the default key
/// hook every call hashes to the same key and therefore the same
/// provider; supply `key_of` to spread calls.
pub struct HashSelector {
    replicas: usize,
    key_of: KeyOf,
}

impl HashSelector {
    pub fn new(replicas: usize, key_of: KeyOf) -> Self {
        HashSelector {
            replicas: replicas.max(1),
            key_of,
        }
    }

    /// A ring with `replicas` virtual nodes per provider and the constant
    /// default key.
    pub fn with_replicas(replicas: usize) -> Self {
        Self::new(replicas, Arc::new(|_ctx, _service_method| "default".to_string()))
    }

    fn hash(key: &str) -> u32 {
        crc32fast::hash(key.as_bytes())
    }
}

impl Selector for HashSelector {
    fn next(
        &self,
        ctx: &Context,
        providers: &[Provider],
        service_method: &str,
        options: &SelectOptions,
    ) -> Result<Provider> {
        let list = options.apply(ctx, providers, service_method);
        if list.is_empty() {
            return Err(RpcError::EmptyProviderList);
        }

        let mut ring: BTreeMap<u32, &Provider> = BTreeMap::new();
        for &provider in &list {
            for replica in 0..self.replicas {
                let virtual_key = Self::hash(&format!("{}{}", provider.key, replica));
                ring.insert(virtual_key, provider);
            }
        }

        let key = (self.key_of)(ctx, service_method);
        let hash = Self::hash(&key);
        let picked = ring
            .range(hash..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, p)| (*p).clone())
            .expect("ring is non-empty");
        Ok(picked)
    }
}

/// Routes to the provider named by the context's pinned-provider metadata
/// entry (`<network>@<addr>` or a bare address).
pub struct PinnedSelector;

impl Selector for PinnedSelector {
    fn next(
        &self,
        ctx: &Context,
        providers: &[Provider],
        service_method: &str,
        options: &SelectOptions,
    ) -> Result<Provider> {
        let Some(target) = ctx.meta(PINNED_PROVIDER_KEY).and_then(MetaValue::as_str) else {
            return Err(RpcError::EmptyProviderList);
        };
        let list = options.apply(ctx, providers, service_method);
        list.into_iter()
            .find(|p| p.key == target || p.addr == target)
            .cloned()
            .ok_or(RpcError::EmptyProviderList)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quillrpc_common::metadata::PROVIDER_DEGRADE_KEY;
    use std::collections::HashMap;

    fn tagged_provider(addr: &str, status: &str) -> Provider {
        let mut tags = HashMap::new();
        tags.insert("status".to_string(), MetaValue::Str(status.to_string()));
        Provider::new("tcp", addr).with_meta(TAGS_KEY, MetaValue::Map(tags))
    }

    fn providers() -> Vec<Provider> {
        vec![
            Provider::new("tcp", "a:1"),
            Provider::new("tcp", "b:2"),
            Provider::new("tcp", "c:3"),
        ]
    }

    #[test]
    fn test_random_selector_empty_list() {
        let selector = RandomSelector;
        let err = selector
            .next(&Context::background(), &[], "Arith.Add", &SelectOptions::default())
            .unwrap_err();
        assert!(matches!(err, RpcError::EmptyProviderList));
    }

    #[test]
    fn test_random_selector_uniform_coverage() {
        let selector = RandomSelector;
        let providers = providers();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let p = selector
                .next(&Context::background(), &providers, "S.M", &SelectOptions::default())
                .unwrap();
            seen.insert(p.key);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_degrade_filter_excludes_flagged() {
        let mut providers = providers();
        providers[0]
            .meta
            .insert(PROVIDER_DEGRADE_KEY.to_string(), MetaValue::Bool(true));
        let options = SelectOptions {
            filters: vec![degrade_filter()],
        };
        let selector = RandomSelector;
        for _ in 0..100 {
            let p = selector
                .next(&Context::background(), &providers, "S.M", &options)
                .unwrap();
            assert_ne!(p.key, "tcp@a:1");
        }
    }

    #[test]
    fn test_tag_filter_matches_exactly() {
        let providers = vec![
            tagged_provider("a:1", "alive"),
            tagged_provider("b:2", "stopped"),
            Provider::new("tcp", "c:3"), // no tags at all
        ];
        let mut want = HashMap::new();
        want.insert("status".to_string(), "alive".to_string());
        let options = SelectOptions {
            filters: vec![tag_filter(want)],
        };
        let selector = RandomSelector;
        for _ in 0..50 {
            let p = selector
                .next(&Context::background(), &providers, "S.M", &options)
                .unwrap();
            assert_eq!(p.key, "tcp@a:1");
        }
    }

    #[test]
    fn test_filters_and_combine() {
        let mut providers = vec![
            tagged_provider("a:1", "alive"),
            tagged_provider("b:2", "alive"),
        ];
        providers[0]
            .meta
            .insert(PROVIDER_DEGRADE_KEY.to_string(), MetaValue::Bool(true));

        let mut want = HashMap::new();
        want.insert("status".to_string(), "alive".to_string());
        let options = SelectOptions {
            filters: vec![degrade_filter(), tag_filter(want)],
        };
        let p = RandomSelector
            .next(&Context::background(), &providers, "S.M", &options)
            .unwrap();
        assert_eq!(p.key, "tcp@b:2");
    }

    #[test]
    fn test_hash_selector_is_deterministic() {
        let selector = HashSelector::with_replicas(8);
        let providers = providers();
        let first = selector
            .next(&Context::background(), &providers, "S.M", &SelectOptions::default())
            .unwrap();
        for _ in 0..20 {
            let again = selector
                .next(&Context::background(), &providers, "S.M", &SelectOptions::default())
                .unwrap();
            assert_eq!(again.key, first.key);
        }
    }

    #[test]
    fn test_hash_selector_key_hook_spreads() {
        let selector = HashSelector::new(
            8,
            Arc::new(|ctx: &Context, _sm: &str| {
                ctx.meta("shard")
                    .and_then(MetaValue::as_str)
                    .unwrap_or("")
                    .to_string()
            }),
        );
        let providers = providers();
        let mut seen = std::collections::HashSet::new();
        for shard in 0..32 {
            let ctx = Context::background().with_meta("shard", format!("shard-{shard}"));
            let p = selector
                .next(&ctx, &providers, "S.M", &SelectOptions::default())
                .unwrap();
            seen.insert(p.key);
        }
        assert!(seen.len() > 1, "distinct keys should reach distinct nodes");
    }

    #[test]
    fn test_pinned_selector_matches_key_or_addr() {
        let providers = providers();
        let selector = PinnedSelector;

        let ctx = Context::background().with_meta(PINNED_PROVIDER_KEY, "tcp@b:2");
        let p = selector
            .next(&ctx, &providers, "S.M", &SelectOptions::default())
            .unwrap();
        assert_eq!(p.addr, "b:2");

        let ctx = Context::background().with_meta(PINNED_PROVIDER_KEY, "c:3");
        let p = selector
            .next(&ctx, &providers, "S.M", &SelectOptions::default())
            .unwrap();
        assert_eq!(p.addr, "c:3");
    }

    #[test]
    fn test_pinned_selector_without_pin_fails() {
        let err = PinnedSelector
            .next(
                &Context::background(),
                &providers(),
                "S.M",
                &SelectOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::EmptyProviderList));
    }
}
