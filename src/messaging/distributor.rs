use crate::error::Error;
use crate::messaging::event::{ChangeEvent, Table};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

/// Tables a subscription follows. An empty filter follows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    tables: HashSet<Table>,
}

impl TableFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I: IntoIterator<Item = Table>>(tables: I) -> Self {
        Self {
            tables: tables.into_iter().collect(),
        }
    }

    /// Parse a comma separated list such as `alerts,videos`
    pub fn parse(list: &str) -> Result<Self, Error> {
        let tables = list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::parse)
            .collect::<Result<HashSet<Table>, Error>>()?;
        Ok(Self { tables })
    }

    pub fn matches(&self, table: Table) -> bool {
        self.tables.is_empty() || self.tables.contains(&table)
    }

    /// The followed tables, in a stable order
    pub fn tables(&self) -> Vec<Table> {
        Table::ALL
            .into_iter()
            .filter(|table| self.matches(*table))
            .collect()
    }
}

/// What a subscriber receives
#[derive(Debug, Clone)]
pub enum Delivery {
    Change(Arc<ChangeEvent>),
    /// The subscriber fell behind and `missed` events were dropped; it must re-read
    /// current state instead of expecting a replay.
    ResyncRequired { missed: u64 },
}

/// Fans committed record changes out to live subscribers.
///
/// The distributor holds no history: a subscription only sees events published after it
/// was created, and a subscriber that falls more than `capacity` events behind is told to
/// resynchronise. Publishers serialize mutations of one record, so events for the same
/// record reach every subscriber in commit order.
#[derive(Clone)]
pub struct RealtimeDistributor {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
}

impl RealtimeDistributor {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver an event to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        debug!(
            "Distributing {} for {} {}",
            event.event_type, event.table, event.record_id
        );
        // An error only means nobody is listening
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self, filter: TableFilter) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
            connected_at: Utc::now(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One live subscriber channel
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    filter: TableFilter,
    connected_at: DateTime<Utc>,
}

impl Subscription {
    /// Next delivery, or `None` once the distributor is gone
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(event.table) => {
                    return Some(Delivery::Change(event))
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Subscriber lagged behind by {} events", missed);
                    return Some(Delivery::ResyncRequired { missed });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn filter(&self) -> &TableFilter {
        &self.filter
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}
