//! Full recompute of partner and team counts from the referral edges.
//!
//! Incremental maintenance in the pipeline is bounded by the ancestor walk
//! depth; this job makes the stored counts exact again.

use std::collections::{HashMap, HashSet, VecDeque};

use matrixsync_core::AppError;
use matrixsync_storage::AggregateStore;
use matrixsync_storage::models::TeamCounts;

/// Exact `(total_partners, total_team)` for every user in `edges`.
///
/// Edges pointing at unknown users or at the user itself are ignored.
/// Users caught in (or hanging below) a referral cycle are counted with a
/// visited set, so malformed data still terminates.
pub fn compute_team_counts(edges: &[(i64, Option<i64>)]) -> Vec<TeamCounts> {
    let parent: HashMap<i64, i64> = edges
        .iter()
        .filter_map(|&(id, referred_by)| referred_by.filter(|&p| p != id).map(|p| (id, p)))
        .collect();
    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    for &(id, _) in edges {
        children.entry(id).or_default();
    }
    for (&child, &p) in &parent {
        if let Some(list) = children.get_mut(&p) {
            list.push(child);
        }
    }

    // Leaves first: a node is settled once all of its children are.
    let mut pending: HashMap<i64, usize> = children.iter().map(|(&id, c)| (id, c.len())).collect();
    let mut team: HashMap<i64, i64> = HashMap::with_capacity(children.len());
    let mut ready: VecDeque<i64> = pending
        .iter()
        .filter(|&(_, &n)| n == 0)
        .map(|(&id, _)| id)
        .collect();

    while let Some(id) = ready.pop_front() {
        let own: i64 = children[&id].iter().map(|c| 1 + team[c]).sum();
        team.insert(id, own);
        if let Some(&p) = parent.get(&id) {
            if let Some(n) = pending.get_mut(&p) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(p);
                }
            }
        }
    }

    // Whatever is left sits on or above a cycle.
    let unsettled: Vec<i64> = children.keys().filter(|id| !team.contains_key(id)).copied().collect();
    for id in unsettled {
        team.insert(id, count_descendants(id, &children));
    }

    let mut counts: Vec<TeamCounts> = children
        .iter()
        .map(|(&id, c)| TeamCounts {
            user_id: id,
            total_partners: c.len() as i64,
            total_team: team[&id],
        })
        .collect();
    counts.sort_by_key(|c| c.user_id);
    counts
}

fn count_descendants(root: i64, children: &HashMap<i64, Vec<i64>>) -> i64 {
    let mut visited = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        for &child in children.get(&id).into_iter().flatten() {
            if visited.insert(child) {
                queue.push_back(child);
            }
        }
    }
    visited.len() as i64 - 1
}

/// Recompute every user's counts and write back the ones that drifted.
pub async fn recompute_hierarchy(store: &dyn AggregateStore) -> Result<u64, AppError> {
    let edges = store.referral_edges().await?;
    let counts = compute_team_counts(&edges);
    let changed = store.apply_team_counts(&counts).await?;
    tracing::info!(users = counts.len(), changed, "Recomputed referral hierarchy");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixsync_storage::MemoryStore;
    use matrixsync_storage::models::NewUser;

    fn counts_of(edges: &[(i64, Option<i64>)]) -> HashMap<i64, (i64, i64)> {
        compute_team_counts(edges)
            .into_iter()
            .map(|c| (c.user_id, (c.total_partners, c.total_team)))
            .collect()
    }

    #[test]
    fn tree_counts_are_transitive() {
        //      1
        //    2   3
        //    4
        //    5
        let counts = counts_of(&[(1, None), (2, Some(1)), (3, Some(1)), (4, Some(2)), (5, Some(4))]);
        assert_eq!(counts[&1], (2, 4));
        assert_eq!(counts[&2], (1, 2));
        assert_eq!(counts[&3], (0, 0));
        assert_eq!(counts[&4], (1, 1));
        assert_eq!(counts[&5], (0, 0));
    }

    #[test]
    fn cycles_terminate() {
        // 1 -> 2 -> 3 -> 1, with 4 hanging below 3.
        let counts = counts_of(&[(1, Some(3)), (2, Some(1)), (3, Some(2)), (4, Some(3))]);
        assert_eq!(counts[&3], (2, 3));
        assert_eq!(counts[&4], (0, 0));
        assert_eq!(counts.len(), 4);
    }

    #[test]
    fn self_and_dangling_edges_are_ignored() {
        let counts = counts_of(&[(1, Some(1)), (2, Some(99))]);
        assert_eq!(counts[&1], (0, 0));
        assert_eq!(counts[&2], (0, 0));
    }

    #[tokio::test]
    async fn recompute_repairs_drifted_counts() {
        let store = MemoryStore::new();
        let user = |id: i64, parent: Option<i64>| NewUser {
            user_id: id,
            wallet_address: format!("0x{id:040x}"),
            full_name: "Unknown".into(),
            referred_by: parent,
            referrer_address: None,
            registration_time: 0,
        };
        store.register_user(&user(1, None), &[]).await.unwrap();
        store.register_user(&user(2, Some(1)), &[]).await.unwrap();
        // No ancestors passed: the root's team misses user 3.
        store.register_user(&user(3, Some(2)), &[]).await.unwrap();
        store
            .force_team_counts(TeamCounts {
                user_id: 2,
                total_partners: 7,
                total_team: 7,
            })
            .await;

        let changed = recompute_hierarchy(&store).await.unwrap();
        assert_eq!(changed, 2);

        let root = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!((root.total_partners, root.total_team), (1, 2));
        let two = store.user_by_id(2).await.unwrap().unwrap();
        assert_eq!((two.total_partners, two.total_team), (1, 1));
        assert_eq!(recompute_hierarchy(&store).await.unwrap(), 0);
    }
}
