use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
};

use ipnet::IpNet;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use weft_config::{first_host, nth_addr, Family};

use crate::IpamError;

const MAX_HOST_BITS: u8 = 64;

/// Hands out the host addresses of one subnet to container ids.
///
/// Host id 0 (network), host id 1 (gateway) and the all-ones host id
/// (broadcast) are never handed out. Every address maps to exactly one id and
/// every id to exactly one address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AllocatorRecord", into = "AllocatorRecord")]
pub struct Allocator {
    subnet: IpNet,
    gateway: IpNet,
    forward: BTreeMap<IpAddr, String>,
    backward: HashMap<String, IpAddr>,
}

/// On-disk shape of an [`Allocator`]: only the address -> id direction is kept.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocatorRecord {
    subnet: IpNet,
    gateway: IpNet,
    #[serde(default)]
    records: BTreeMap<IpAddr, String>,
}

impl Allocator {
    pub fn new(subnet: IpNet) -> Result<Self, IpamError> {
        let subnet = subnet.trunc();
        let host_bits = subnet.max_prefix_len() - subnet.prefix_len();
        if host_bits < 2 {
            return Err(IpamError::SubnetTooSmall { subnet, host_bits });
        }
        if host_bits > MAX_HOST_BITS {
            warn!(%subnet, "subnet too big, only the lowest {MAX_HOST_BITS} host bits are used");
        }

        let gateway = with_prefix(first_host(&subnet), subnet.prefix_len());

        Ok(Self {
            subnet,
            gateway,
            forward: BTreeMap::new(),
            backward: HashMap::new(),
        })
    }

    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    pub fn gateway(&self) -> IpNet {
        self.gateway
    }

    pub fn mask(&self) -> IpAddr {
        self.subnet.netmask()
    }

    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix_len()
    }

    pub fn family(&self) -> Family {
        Family::of(&self.subnet)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Number of addresses this allocator can hand out.
    pub fn capacity(&self) -> u128 {
        (1u128 << self.host_bits()) - 3
    }

    fn host_bits(&self) -> u8 {
        (self.subnet.max_prefix_len() - self.subnet.prefix_len()).min(MAX_HOST_BITS)
    }

    /// Returns the address leased to `id`, leasing a free one first if needed.
    /// Repeated calls with the same id return the same address.
    pub fn alloc(&mut self, id: &str) -> Result<IpNet, IpamError> {
        if let Some(addr) = self.get_by_id(id) {
            debug!(id, %addr, "address already allocated");
            return Ok(addr);
        }

        let capacity = self.capacity();
        let used = self.forward.len() as u128;
        if used >= capacity {
            return Err(IpamError::Exhausted {
                subnet: self.subnet,
            });
        }

        // Random probing stays cheap while at most half of the subnet is
        // taken; past that the scan keeps the cost bounded.
        let host = if used * 2 <= capacity {
            self.probe_random(capacity)
        } else {
            self.scan_lowest_free()
        };

        let addr = nth_addr(&self.subnet, host);
        self.insert(addr, id.to_owned());
        debug!(id, %addr, "allocated address");

        Ok(with_prefix(addr, self.prefix_len()))
    }

    /// Forgets the lease of `id`. Unknown ids are ignored.
    pub fn release(&mut self, id: &str) {
        if let Some(addr) = self.remove(id) {
            debug!(id, %addr, "released address");
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<IpNet> {
        self.backward
            .get(id)
            .map(|addr| with_prefix(*addr, self.prefix_len()))
    }

    pub fn get_by_addr(&self, addr: &IpAddr) -> Option<&str> {
        self.forward.get(addr).map(String::as_str)
    }

    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        self.subnet.contains(addr) && self.forward.contains_key(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &str)> {
        self.forward.iter().map(|(addr, id)| (addr, id.as_str()))
    }

    fn probe_random(&self, capacity: u128) -> u128 {
        let mut rng = rand::thread_rng();
        loop {
            let host = rng.gen_range(2..=capacity + 1);
            if !self.forward.contains_key(&nth_addr(&self.subnet, host)) {
                return host;
            }
        }
    }

    /// Walks the leases in address order and returns the first gap.
    fn scan_lowest_free(&self) -> u128 {
        let mut expected = 2;
        for addr in self.forward.keys() {
            let Some(host) = self.host_id(addr) else {
                continue;
            };
            if host > expected {
                break;
            }
            if host == expected {
                expected += 1;
            }
        }
        expected
    }

    fn host_id(&self, addr: &IpAddr) -> Option<u128> {
        if !self.subnet.contains(addr) {
            return None;
        }
        Some(addr_bits(addr) - addr_bits(&self.subnet.network()))
    }

    fn is_reserved(&self, addr: &IpAddr) -> bool {
        *addr == self.subnet.network()
            || *addr == self.subnet.broadcast()
            || *addr == self.gateway.addr()
    }

    fn insert(&mut self, addr: IpAddr, id: String) {
        if let Some(stale) = self.backward.insert(id.clone(), addr) {
            self.forward.remove(&stale);
        }
        if let Some(stale) = self.forward.insert(addr, id) {
            self.backward.remove(&stale);
        }
    }

    fn remove(&mut self, id: &str) -> Option<IpAddr> {
        let addr = self.backward.remove(id)?;
        self.forward.remove(&addr);
        Some(addr)
    }
}

impl TryFrom<AllocatorRecord> for Allocator {
    type Error = IpamError;

    fn try_from(record: AllocatorRecord) -> Result<Self, Self::Error> {
        let mut allocator = Allocator::new(record.subnet)?;

        if !allocator.subnet.contains(&record.gateway.addr()) {
            return Err(IpamError::InvalidRecord(format!(
                "gateway {} outside subnet {}",
                record.gateway, allocator.subnet
            )));
        }
        allocator.gateway = with_prefix(record.gateway.addr(), allocator.prefix_len());

        for (addr, id) in record.records {
            if !allocator.subnet.contains(&addr) || allocator.is_reserved(&addr) {
                return Err(IpamError::InvalidRecord(format!(
                    "{addr} is not a usable address of {}",
                    allocator.subnet
                )));
            }
            if allocator.backward.contains_key(&id) {
                return Err(IpamError::InvalidRecord(format!(
                    "{id} holds more than one address"
                )));
            }
            allocator.insert(addr, id);
        }

        Ok(allocator)
    }
}

impl From<Allocator> for AllocatorRecord {
    fn from(allocator: Allocator) -> Self {
        Self {
            subnet: allocator.subnet,
            gateway: allocator.gateway,
            records: allocator.forward,
        }
    }
}

fn addr_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn with_prefix(addr: IpAddr, prefix_len: u8) -> IpNet {
    // prefix_len always comes from a subnet of the same family
    IpNet::new(addr, prefix_len).unwrap_or_else(|_| IpNet::from(addr))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn allocator(subnet: &str) -> Allocator {
        Allocator::new(subnet.parse().unwrap()).unwrap()
    }

    #[test]
    fn small_subnet_scenario() {
        let mut record = allocator("192.168.1.0/29");
        assert_eq!(record.capacity(), 5);
        assert_eq!(record.gateway().to_string(), "192.168.1.1/29");

        let ips = (0..5)
            .map(|i| record.alloc(&i.to_string()).unwrap())
            .collect::<Vec<_>>();

        let distinct = ips.iter().map(IpNet::addr).collect::<HashSet<_>>();
        assert_eq!(distinct.len(), 5);
        for ip in &ips {
            assert_eq!(ip.prefix_len(), 29);
            let last = ip.addr().to_string();
            let host: u8 = last.rsplit('.').next().unwrap().parse().unwrap();
            assert!((2..=6).contains(&host), "{ip} is reserved");
        }

        assert!(matches!(
            record.alloc("5"),
            Err(IpamError::Exhausted { .. })
        ));

        record.release("2");
        assert_eq!(record.alloc("5").unwrap(), ips[2]);
    }

    #[test]
    fn alloc_is_idempotent() {
        let mut record = allocator("192.168.1.0/24");

        let ip1 = record.alloc("123123123").unwrap();
        let ip2 = record.alloc("123123123").unwrap();
        let ip3 = record.alloc("312312312").unwrap();

        assert_eq!(ip1, ip2);
        assert_ne!(ip1, ip3);
        assert_eq!(record.len(), 2);
        assert!(record.subnet().contains(&ip1.addr()));
    }

    #[test]
    fn release_recovers_exactly_one() {
        let mut record = allocator("10.0.0.0/28");
        let capacity = record.capacity() as usize;
        for i in 0..capacity {
            record.alloc(&format!("c{i}")).unwrap();
        }
        assert!(record.alloc("extra").is_err());

        record.release("c3");
        record.alloc("extra").unwrap();
        assert!(record.alloc("another").is_err());
        assert_eq!(record.len(), capacity);
    }

    #[test]
    fn fill_subnet_without_reserved_addresses() {
        let mut record = allocator("10.244.0.0/24");
        assert_eq!(record.capacity(), 253);

        for i in 0..253 {
            record.alloc(&format!("pod-{i}")).unwrap();
        }

        let subnet = record.subnet();
        let gateway = record.gateway().addr();
        let addrs = record.iter().map(|(addr, _)| *addr).collect::<HashSet<_>>();
        assert_eq!(addrs.len(), 253);
        assert!(!addrs.contains(&subnet.network()));
        assert!(!addrs.contains(&subnet.broadcast()));
        assert!(!addrs.contains(&gateway));
    }

    #[test]
    fn release_unknown_is_noop() {
        let mut record = allocator("10.0.0.0/24");
        let ip = record.alloc("a").unwrap();

        record.release("missing");
        record.release("a");
        record.release("a");

        assert!(record.is_empty());
        assert!(record.get_by_id("a").is_none());
        assert!(!record.contains_addr(&ip.addr()));
    }

    #[test]
    fn lookups() {
        let mut record = allocator("10.0.0.0/24");
        let ip = record.alloc("a").unwrap();

        assert_eq!(record.get_by_id("a"), Some(ip));
        assert_eq!(record.get_by_addr(&ip.addr()), Some("a"));
        assert!(record.contains_addr(&ip.addr()));
        assert_eq!(record.mask().to_string(), "255.255.255.0");
        assert_eq!(record.family(), Family::V4);
    }

    #[test]
    fn reject_tiny_subnets() {
        assert!(matches!(
            Allocator::new("10.0.0.0/31".parse().unwrap()),
            Err(IpamError::SubnetTooSmall { host_bits: 1, .. })
        ));

        let mut record = allocator("10.0.0.0/30");
        assert_eq!(record.capacity(), 1);
        assert_eq!(record.alloc("a").unwrap().to_string(), "10.0.0.2/30");
        assert!(record.alloc("b").is_err());
    }

    #[test]
    fn ipv6_subnets_are_capped() {
        let mut record = allocator("fd00:10:244::/48");
        assert_eq!(record.capacity(), (1u128 << 64) - 3);
        assert_eq!(record.gateway().to_string(), "fd00:10:244::1/48");

        let ip = record.alloc("a").unwrap();
        assert!(record.subnet().contains(&ip.addr()));
        assert_eq!(ip.prefix_len(), 48);
    }

    #[test]
    fn serde_round_trip() {
        let mut record = allocator("10.244.1.0/24");
        let ids = ["a", "b", "c"];
        for id in ids {
            record.alloc(id).unwrap();
        }

        let json = serde_json::to_string(&record).unwrap();
        let decoded: Allocator = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded, record);
        for id in ids {
            assert_eq!(decoded.get_by_id(id), record.get_by_id(id));
        }
    }

    #[test]
    fn decode_rejects_reserved_and_duplicate_records() {
        let gateway_leased = r#"{"subnet":"10.0.0.0/24","gateway":"10.0.0.1/24","records":{"10.0.0.1":"a"}}"#;
        assert!(serde_json::from_str::<Allocator>(gateway_leased).is_err());

        let outside = r#"{"subnet":"10.0.0.0/24","gateway":"10.0.0.1/24","records":{"10.0.1.9":"a"}}"#;
        assert!(serde_json::from_str::<Allocator>(outside).is_err());

        let duplicate = r#"{"subnet":"10.0.0.0/24","gateway":"10.0.0.1/24","records":{"10.0.0.5":"a","10.0.0.6":"a"}}"#;
        assert!(serde_json::from_str::<Allocator>(duplicate).is_err());
    }

    #[test]
    fn scan_finds_lowest_gap() {
        let mut record = allocator("10.0.0.0/29");
        for id in ["a", "b", "c", "d", "e"] {
            record.alloc(id).unwrap();
        }
        let freed = record.get_by_id("b").unwrap().addr();
        record.release("b");

        assert_eq!(record.scan_lowest_free(), record.host_id(&freed).unwrap());
    }
}
