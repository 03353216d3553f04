//! Replica placement for chunk allocations.
//!
//! Placement records where replicas are *supposed* to go; scrub and the
//! orphan scan are the ground truth afterwards, and the repair loop
//! reconciles the two.

use crate::types::{ChunkServerInfo, ServerId};

/// Picks up to `count` replica targets from the given ONLINE servers.
///
/// Servers are ranked by available space descending; one replica goes to
/// each distinct availability zone round-robin before any zone receives a
/// second. With fewer than `count` servers, all of them are returned; the
/// upload proceeds with reduced durability and the repair loop converges
/// the replica count later.
pub fn select_servers(servers: &[ChunkServerInfo], count: usize) -> Vec<ServerId> {
    if count == 0 || servers.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<&ChunkServerInfo> = servers.iter().collect();
    ranked.sort_by(|a, b| {
        b.available()
            .cmp(&a.available())
            .then_with(|| a.server_id.cmp(&b.server_id))
    });

    // Zones in order of their most-spacious member, each holding its
    // members space-descending.
    let mut zone_order: Vec<&str> = Vec::new();
    let mut by_zone: Vec<Vec<&ChunkServerInfo>> = Vec::new();
    for &server in &ranked {
        match zone_order.iter().position(|z| *z == server.zone.as_str()) {
            Some(i) => by_zone[i].push(server),
            None => {
                zone_order.push(server.zone.as_str());
                by_zone.push(vec![server]);
            }
        }
    }

    let mut selected = Vec::with_capacity(count);
    let mut round = 0;
    while selected.len() < count {
        let mut picked_any = false;
        for zone in &by_zone {
            if selected.len() >= count {
                break;
            }
            if let Some(server) = zone.get(round) {
                selected.push(server.server_id.clone());
                picked_any = true;
            }
        }
        if !picked_any {
            break;
        }
        round += 1;
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ServerStatus, Timestamp};

    fn server(id: &str, zone: &str, available: u64) -> ChunkServerInfo {
        ChunkServerInfo {
            server_id: ServerId::new(id),
            address: format!("{}:7000", id),
            capacity: 1 << 40,
            used: (1u64 << 40) - available,
            chunk_count: 0,
            zone: zone.to_string(),
            status: ServerStatus::Online,
            last_heartbeat: Timestamp::from_secs(0),
        }
    }

    #[test]
    fn test_prefers_distinct_zones() {
        let servers = vec![
            server("s1", "z1", 1000),
            server("s2", "z1", 900),
            server("s3", "z2", 800),
            server("s4", "z3", 700),
        ];
        let picked = select_servers(&servers, 3);
        assert_eq!(
            picked,
            vec![ServerId::new("s1"), ServerId::new("s3"), ServerId::new("s4")]
        );
    }

    #[test]
    fn test_revisits_zones_when_short_on_zones() {
        let servers = vec![
            server("s1", "z1", 1000),
            server("s2", "z1", 900),
            server("s3", "z2", 800),
        ];
        let picked = select_servers(&servers, 3);
        // One per zone first, then back to z1's next most-spacious.
        assert_eq!(
            picked,
            vec![ServerId::new("s1"), ServerId::new("s3"), ServerId::new("s2")]
        );
    }

    #[test]
    fn test_short_fleet_returns_everything() {
        let servers = vec![server("s1", "z1", 100), server("s2", "z2", 50)];
        let picked = select_servers(&servers, 3);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_most_spacious_leads() {
        let servers = vec![
            server("small", "z1", 10),
            server("big", "z2", 10_000),
            server("medium", "z3", 500),
        ];
        let picked = select_servers(&servers, 2);
        assert_eq!(picked[0], ServerId::new("big"));
        assert_eq!(picked[1], ServerId::new("medium"));
    }

    #[test]
    fn test_empty_fleet_and_zero_count() {
        assert!(select_servers(&[], 3).is_empty());
        assert!(select_servers(&[server("s1", "z1", 1)], 0).is_empty());
    }

    #[test]
    fn test_equal_space_is_deterministic() {
        let servers = vec![
            server("b", "z1", 100),
            server("a", "z2", 100),
            server("c", "z3", 100),
        ];
        let first = select_servers(&servers, 3);
        let second = select_servers(&servers, 3);
        assert_eq!(first, second);
        assert_eq!(first[0], ServerId::new("a"));
    }
}
