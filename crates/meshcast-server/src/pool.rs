//! Forwarder pool: a per-channel sorted set of forwarding candidates.
//!
//! Entries are ordered by a composite 64-bit score so one integer compare
//! ranks them: current peer connection count in the high bits (a proven
//! forwarder wins), elapsed lifetime below it (age breaks count ties), and
//! the client id breaks exact score ties. Saturated forwarders are evicted
//! so they are never handed another fetcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use meshcast_core::db::{unix_timestamp, ClientInfo, DatabaseError, SignalDatabase};

// Bit layout: 63..61 connection count, 60..29 elapsed seconds, low bits
// reserved.
const CONNECTION_COUNT_SHIFT: u32 = 61;
const ELAPSED_SECONDS_SHIFT: u32 = 29;
const CONNECTION_COUNT_MASK: u64 = 0x7;
const ELAPSED_SECONDS_MASK: u64 = 0xFFFF_FFFF;

fn composite_score(connection_count: u64, created_at: i64) -> u64 {
    let elapsed = (unix_timestamp() - created_at).max(0) as u64;
    ((connection_count & CONNECTION_COUNT_MASK) << CONNECTION_COUNT_SHIFT)
        | ((elapsed & ELAPSED_SECONDS_MASK) << ELAPSED_SECONDS_SHIFT)
}

#[derive(Default)]
struct ChannelSet {
    entries: BTreeMap<(u64, String), ClientInfo>,
    index: HashMap<String, u64>,
}

impl ChannelSet {
    fn insert(&mut self, score: u64, client: ClientInfo) {
        self.remove(&client.id);
        self.index.insert(client.id.clone(), score);
        self.entries.insert((score, client.id.clone()), client);
    }

    fn remove(&mut self, client_id: &str) {
        if let Some(score) = self.index.remove(client_id) {
            self.entries.remove(&(score, client_id.to_string()));
        }
    }

    fn get(&self, client_id: &str) -> Option<&ClientInfo> {
        let score = self.index.get(client_id)?;
        self.entries.get(&(*score, client_id.to_string()))
    }

    fn top(&self) -> Option<&ClientInfo> {
        self.entries.values().next_back()
    }
}

/// Per-channel candidate sets plus the store handle used to derive
/// connection counts at score time.
pub struct ForwarderPool {
    sets: RwLock<HashMap<String, Arc<Mutex<ChannelSet>>>>,
    db: SignalDatabase,
}

impl ForwarderPool {
    pub fn new(db: SignalDatabase) -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            db,
        }
    }

    /// Insert or refresh a candidate with a freshly computed score.
    pub async fn add_client(&self, client: ClientInfo) -> Result<(), DatabaseError> {
        let set = self.set_for(&client.channel_id).await;
        let mut set = set.lock().await;

        let count = self.connection_count(&client.id, &client.channel_id).await?;
        let score = composite_score(count, client.created_at);
        set.insert(score, client);
        Ok(())
    }

    /// Recompute a candidate's score. Unknown candidates are refetched from
    /// the store; saturated ones are evicted.
    pub async fn update_client_score(
        &self,
        client_id: &str,
        channel_id: &str,
        max_forwarding_number: i64,
    ) -> Result<(), DatabaseError> {
        let set = self.set_for(channel_id).await;
        let mut set = set.lock().await;

        let client = match set.get(client_id) {
            Some(client) => client.clone(),
            None => self.db.find_client(channel_id, client_id).await?,
        };

        let count = self.connection_count(client_id, channel_id).await?;
        if count >= max_forwarding_number.max(0) as u64 {
            set.remove(client_id);
            return Ok(());
        }

        let score = composite_score(count, client.created_at);
        set.insert(score, client);
        Ok(())
    }

    /// The highest-scored candidate for a channel, if any.
    pub async fn top_forwarder(&self, channel_id: &str) -> Option<ClientInfo> {
        let set = self.set_for(channel_id).await;
        let set = set.lock().await;
        set.top().cloned()
    }

    /// Drop a candidate, e.g. when its client deactivates.
    pub async fn remove_client(&self, client_id: &str, channel_id: &str) {
        let set = self.set_for(channel_id).await;
        set.lock().await.remove(client_id);
    }

    async fn connection_count(
        &self,
        client_id: &str,
        channel_id: &str,
    ) -> Result<u64, DatabaseError> {
        let connections = self.db.find_all_peer_by_from(channel_id, client_id).await?;
        Ok(connections.len() as u64)
    }

    async fn set_for(&self, channel_id: &str) -> Arc<Mutex<ChannelSet>> {
        {
            let sets = self.sets.read().await;
            if let Some(set) = sets.get(channel_id) {
                return Arc::clone(set);
            }
        }
        let mut sets = self.sets.write().await;
        let set = sets
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ChannelSet::default())));
        Arc::clone(set)
    }
}
