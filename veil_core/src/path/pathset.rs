/*! A pool of paths owned by one entity, rebuilt as members expire.

Paths are keyed by `(first hop router, receive path id at that hop)`, which
is exactly what a forwarded frame carries, so routing an inbound frame to its
owning path is a single map lookup.

*/

use std::collections::BTreeMap;
use std::time::Instant;

use rand::seq::IteratorRandom;
use rand::thread_rng;

use veil_packet::introset::Introduction;
use veil_packet::path_id::PathId;
use veil_packet::router_contact::{RouterContact, RouterId};

use crate::path::{Path, PathHop, PathStatus};

/// Default number of paths an owner maintains.
pub const DEFAULT_NUM_PATHS: usize = 4;

/// Default number of hops in a path.
pub const DEFAULT_NUM_HOPS: usize = 4;

/// Capability injected into a path set: how to choose the router for each
/// hop of a new path.
pub trait HopSelector {
    /// Choose the router for hop `hop_index` out of `num_hops`. `prev` is
    /// the previous hop, `chosen` all routers already in the path.
    fn select_hop(
        &self,
        candidates: &[RouterContact],
        prev: Option<&RouterContact>,
        chosen: &[RouterId],
        hop_index: usize,
        num_hops: usize,
    ) -> Option<RouterContact>;
}

/// Default selection: a random routable peer not already in the path.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomHopSelector;

impl HopSelector for RandomHopSelector {
    fn select_hop(
        &self,
        candidates: &[RouterContact],
        prev: Option<&RouterContact>,
        chosen: &[RouterId],
        _hop_index: usize,
        _num_hops: usize,
    ) -> Option<RouterContact> {
        candidates
            .iter()
            .filter(|rc| prev.map(|prev| prev.id != rc.id).unwrap_or(true))
            .filter(|rc| !chosen.contains(&rc.id))
            .choose(&mut thread_rng())
            .cloned()
    }
}

/// Selection for aligned paths: the final hop is pinned to the router of the
/// selected introduction.
#[derive(Clone, Debug)]
pub struct AlignedHopSelector {
    /// Router the path must terminate at.
    pub terminal: RouterContact,
}

impl HopSelector for AlignedHopSelector {
    fn select_hop(
        &self,
        candidates: &[RouterContact],
        prev: Option<&RouterContact>,
        chosen: &[RouterId],
        hop_index: usize,
        num_hops: usize,
    ) -> Option<RouterContact> {
        if hop_index == num_hops - 1 {
            Some(self.terminal.clone())
        } else {
            candidates
                .iter()
                .filter(|rc| rc.id != self.terminal.id)
                .filter(|rc| prev.map(|prev| prev.id != rc.id).unwrap_or(true))
                .filter(|rc| !chosen.contains(&rc.id))
                .choose(&mut thread_rng())
                .cloned()
        }
    }
}

/// A set of paths owned by an endpoint or outbound context.
#[derive(Clone, Debug)]
pub struct PathSet {
    num_paths: usize,
    num_hops: usize,
    paths: BTreeMap<(RouterId, PathId), Path>,
}

impl PathSet {
    /// Create an empty set that maintains `num_paths` paths of `num_hops`
    /// hops.
    pub fn new(num_paths: usize, num_hops: usize) -> PathSet {
        PathSet {
            num_paths,
            num_hops,
            paths: BTreeMap::new(),
        }
    }

    /// Insert a freshly created path.
    pub fn add_path(&mut self, path: Path) {
        self.paths.insert((path.upstream(), path.rx_id()), path);
    }

    /// Find the path a forwarded frame belongs to.
    pub fn get_by_upstream(&self, router: RouterId, rx_id: PathId) -> Option<&Path> {
        self.paths.get(&(router, rx_id))
    }

    /// Mark a building path as established. Returns false when no such path
    /// exists.
    pub fn handle_path_built(
        &mut self,
        router: RouterId,
        rx_id: PathId,
        now: Instant,
        now_ms: u64,
    ) -> bool {
        match self.paths.get_mut(&(router, rx_id)) {
            Some(path) => {
                path.handle_built(now, now_ms);
                info!("path via {} established", router);
                true
            }
            None => false,
        }
    }

    /// Mark a building path as failed; the next tick replaces it.
    pub fn handle_path_build_failed(&mut self, router: RouterId, rx_id: PathId) {
        if let Some(path) = self.paths.get_mut(&(router, rx_id)) {
            warn!("path build via {} failed", router);
            path.status = PathStatus::Timeout;
        }
    }

    /// Number of paths currently in a status.
    pub fn num_in_status(&self, status: PathStatus) -> usize {
        self.paths
            .values()
            .filter(|path| path.status == status)
            .count()
    }

    /// Return true if we should build another path.
    pub fn should_build_more(&self) -> bool {
        self.num_in_status(PathStatus::Building) + self.num_in_status(PathStatus::Established)
            < self.num_paths
    }

    /// Return true if at least one established path can carry a publish.
    pub fn can_publish(&self) -> bool {
        self.num_in_status(PathStatus::Established) > 0
    }

    /// Uniformly pick one established path.
    pub fn pick_random_established_path(&self) -> Option<&Path> {
        self.paths
            .values()
            .filter(|path| path.status == PathStatus::Established)
            .choose(&mut thread_rng())
    }

    /// The established path whose far end is closest to `key` by XOR
    /// distance.
    pub fn get_established_path_closest_to(&self, key: &[u8; 32]) -> Option<&Path> {
        self.paths
            .values()
            .filter(|path| path.status == PathStatus::Established)
            .min_by(|a, b| {
                a.endpoint_router()
                    .cmp_distance(&b.endpoint_router(), key)
            })
    }

    /// The established path terminating at a specific router, if any.
    pub fn get_path_by_router(&self, router: RouterId) -> Option<&Path> {
        self.paths
            .values()
            .filter(|path| path.status == PathStatus::Established)
            .find(|path| path.endpoint_router() == router)
    }

    /// Introductions provided by all established paths.
    pub fn get_current_introductions(&self) -> Vec<Introduction> {
        self.paths
            .values()
            .filter(|path| path.status == PathStatus::Established)
            .map(|path| *path.intro())
            .collect()
    }

    /// Expire established paths past their rebuild point, fail builds that
    /// took too long and drop every dead path.
    pub fn expire_paths(&mut self, now: Instant) {
        for path in self.paths.values_mut() {
            if path.is_expiring(now) {
                debug!("path via {} expired", path.upstream());
                path.status = PathStatus::Expired;
            } else if path.build_timed_out(now) {
                warn!("path build via {} timed out", path.upstream());
                path.status = PathStatus::Timeout;
            }
        }
        self.paths.retain(|_, path| {
            path.status != PathStatus::Expired && path.status != PathStatus::Timeout
        });
    }

    /// Expire paths and start at most one new build when the set is short.
    /// Returns the number of builds started.
    pub fn tick(
        &mut self,
        now: Instant,
        candidates: &[RouterContact],
        selector: &dyn HopSelector,
    ) -> usize {
        self.expire_paths(now);
        if !self.should_build_more() || self.num_in_status(PathStatus::Building) > 0 {
            return 0;
        }
        match self.build_path(candidates, selector) {
            Some(()) => 1,
            None => {
                trace!("not enough routers to build a path");
                0
            }
        }
    }

    fn build_path(&mut self, candidates: &[RouterContact], selector: &dyn HopSelector) -> Option<()> {
        let mut hops = Vec::with_capacity(self.num_hops);
        let mut chosen = Vec::with_capacity(self.num_hops);
        for hop_index in 0..self.num_hops {
            let prev = hops.last().map(|hop: &PathHop| &hop.rc);
            let rc = selector.select_hop(candidates, prev, &chosen, hop_index, self.num_hops)?;
            chosen.push(rc.id);
            hops.push(PathHop::new(rc));
        }
        let path = Path::new(hops);
        debug!(
            "building path via {} terminating at {}",
            path.upstream(),
            path.endpoint_router()
        );
        self.add_path(path);
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::time::Duration;

    use crate::path::{PATH_LIFETIME, REBUILD_MARGIN};
    use crate::time::clock_now;

    use rand::thread_rng;
    use veil_crypto::{SecretKey, SigningKey};
    use veil_packet::ip_port::IpPort;

    fn test_candidates(n: usize) -> Vec<RouterContact> {
        let mut rng = thread_rng();
        (0..n)
            .map(|i| {
                RouterContact::new(
                    &SigningKey::generate(&mut rng),
                    SecretKey::generate(&mut rng).public_key(),
                    IpPort {
                        ip_addr: "127.0.0.1".parse().unwrap(),
                        port: 1000 + i as u16,
                    },
                    1234567890,
                )
            })
            .collect()
    }

    fn build_established(set: &mut PathSet, candidates: &[RouterContact], n: usize) {
        for _ in 0..n {
            assert_eq!(set.tick(clock_now(), candidates, &RandomHopSelector), 1);
            let (router, rx_id) = {
                let path = set
                    .paths
                    .values()
                    .find(|path| path.status == PathStatus::Building)
                    .unwrap();
                (path.upstream(), path.rx_id())
            };
            assert!(set.handle_path_built(router, rx_id, clock_now(), 1_000_000));
        }
    }

    #[tokio::test]
    async fn builds_up_to_num_paths() {
        let candidates = test_candidates(12);
        let mut set = PathSet::new(4, 4);
        build_established(&mut set, &candidates, 4);
        assert_eq!(set.num_in_status(PathStatus::Established), 4);
        assert!(!set.should_build_more());
        assert_eq!(set.tick(clock_now(), &candidates, &RandomHopSelector), 0);
    }

    #[tokio::test]
    async fn one_build_in_flight_at_a_time() {
        let candidates = test_candidates(12);
        let mut set = PathSet::new(4, 4);
        assert_eq!(set.tick(clock_now(), &candidates, &RandomHopSelector), 1);
        // the first build has not confirmed yet
        assert_eq!(set.tick(clock_now(), &candidates, &RandomHopSelector), 0);
        assert_eq!(set.num_in_status(PathStatus::Building), 1);
    }

    #[tokio::test]
    async fn hops_are_distinct() {
        let candidates = test_candidates(12);
        let mut set = PathSet::new(1, 4);
        set.tick(clock_now(), &candidates, &RandomHopSelector);
        let path = set.paths.values().next().unwrap();
        let ids = (0..4).map(|i| path.hops[i].rc.id).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn expired_path_triggers_exactly_one_rebuild() {
        tokio::time::pause();
        let candidates = test_candidates(12);
        let mut set = PathSet::new(4, 4);
        build_established(&mut set, &candidates, 4);

        tokio::time::advance(PATH_LIFETIME - REBUILD_MARGIN + Duration::from_secs(1)).await;
        assert_eq!(set.num_in_status(PathStatus::Established), 4);
        let started = set.tick(clock_now(), &candidates, &RandomHopSelector);
        // all four expired at once, exactly one replacement build started
        assert_eq!(set.num_in_status(PathStatus::Established), 0);
        assert!(set.should_build_more());
        assert_eq!(started, 1);
        assert_eq!(set.num_in_status(PathStatus::Building), 1);
    }

    #[tokio::test]
    async fn build_timeout_fails_path() {
        tokio::time::pause();
        let candidates = test_candidates(12);
        let mut set = PathSet::new(1, 4);
        set.tick(clock_now(), &candidates, &RandomHopSelector);
        tokio::time::advance(crate::path::PATH_BUILD_TIMEOUT + Duration::from_secs(1)).await;
        // the timed out build is dropped and a new one started
        assert_eq!(set.tick(clock_now(), &candidates, &RandomHopSelector), 1);
        assert_eq!(set.num_in_status(PathStatus::Building), 1);
    }

    #[tokio::test]
    async fn pick_random_established_none_when_empty() {
        let set = PathSet::new(4, 4);
        assert!(set.pick_random_established_path().is_none());
    }

    #[tokio::test]
    async fn pick_random_established_covers_all() {
        let candidates = test_candidates(16);
        let mut set = PathSet::new(3, 4);
        build_established(&mut set, &candidates, 3);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let path = set.pick_random_established_path().unwrap();
            seen.insert((path.upstream(), path.rx_id()));
        }
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn aligned_selector_pins_terminal_hop() {
        let candidates = test_candidates(12);
        let terminal = candidates[0].clone();
        let mut set = PathSet::new(1, 4);
        set.tick(
            clock_now(),
            &candidates,
            &AlignedHopSelector {
                terminal: terminal.clone(),
            },
        );
        let path = set.paths.values().next().unwrap();
        assert_eq!(path.endpoint_router(), terminal.id);
        // the terminal router appears nowhere else in the path
        assert!(path.hops[..3].iter().all(|hop| hop.rc.id != terminal.id));
    }

    #[tokio::test]
    async fn get_by_upstream() {
        let candidates = test_candidates(12);
        let mut set = PathSet::new(2, 4);
        build_established(&mut set, &candidates, 2);
        let (router, rx_id) = {
            let path = set.paths.values().next().unwrap();
            (path.upstream(), path.rx_id())
        };
        assert!(set.get_by_upstream(router, rx_id).is_some());
        assert!(set.get_by_upstream(router, PathId([99; 16])).is_none());
    }

    #[tokio::test]
    async fn current_introductions_from_established() {
        let candidates = test_candidates(12);
        let mut set = PathSet::new(2, 4);
        build_established(&mut set, &candidates, 2);
        set.tick(clock_now(), &candidates, &RandomHopSelector);

        let intros = set.get_current_introductions();
        assert_eq!(intros.len(), 2);
        for intro in intros {
            assert!(!intro.router.is_zero());
            assert!(!intro.path_id.is_zero());
        }
    }
}
