//! Routing table maintenance logic.

use std::time::{Duration, Instant};

use crate::common::{Contact, Id, RoutingTable};

pub(crate) const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub(crate) const PING_TABLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Routing table maintenance state
#[derive(Debug)]
pub struct RoutingMaintenance {
    random_lookup: bool,
    last_table_refresh: Instant,
    last_table_ping: Instant,
}

/// Decisions about routing table maintenance
#[derive(Debug, Default)]
pub struct MaintenanceDecisions {
    /// Whether to look ourselves up again, to (re)populate the table.
    pub should_populate: bool,

    /// Targets of lookups refreshing the table.
    pub refresh_targets: Vec<Id>,

    /// Contacts to ping, either failing or queued by full buckets.
    pub contacts_to_ping: Vec<Contact>,

    /// Whether dead replacement entries should be purged.
    pub should_purge: bool,
}

impl RoutingMaintenance {
    /// Create new routing maintenance tracker
    pub fn new(random_lookup: bool) -> Self {
        RoutingMaintenance {
            random_lookup,
            last_table_refresh: Instant::now(),
            last_table_ping: Instant::now(),
        }
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Computes decisions and resets internal timers when intervals elapse.
    pub fn periodic_maintenance_decisions(
        &mut self,
        routing_table: &mut RoutingTable,
    ) -> MaintenanceDecisions {
        self.periodic_maintenance_decisions_at(Instant::now(), routing_table)
    }

    pub(crate) fn periodic_maintenance_decisions_at(
        &mut self,
        now: Instant,
        routing_table: &mut RoutingTable,
    ) -> MaintenanceDecisions {
        let refresh_is_due =
            now.saturating_duration_since(self.last_table_refresh) >= REFRESH_TABLE_INTERVAL;
        let ping_is_due =
            now.saturating_duration_since(self.last_table_ping) >= PING_TABLE_INTERVAL;

        let mut decisions = MaintenanceDecisions {
            contacts_to_ping: routing_table.take_pending_pings(),
            ..Default::default()
        };

        // An empty table keeps trying, but doesn't count as a refresh.
        if routing_table.is_empty() {
            decisions.should_populate = refresh_is_due;
            return decisions;
        }

        if refresh_is_due {
            self.last_table_refresh = now;

            decisions.should_populate = true;

            if self.random_lookup {
                decisions.refresh_targets.push(Id::random());
            }

            decisions.refresh_targets.extend(
                routing_table.idle_bucket_targets(now, REFRESH_TABLE_INTERVAL),
            );
        }

        if ping_is_due {
            self.last_table_ping = now;
            decisions.should_purge = true;

            for contact in routing_table.contacts() {
                if contact.failures() > 0
                    && !decisions
                        .contacts_to_ping
                        .iter()
                        .any(|c| c.id() == contact.id())
                {
                    decisions.contacts_to_ping.push(contact.clone());
                }
            }
        }

        decisions
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::common::{Contact, Id, RoutingTable};

    use super::{RoutingMaintenance, PING_TABLE_INTERVAL, REFRESH_TABLE_INTERVAL};

    #[test]
    fn empty_table_does_not_reset_refresh_timer() {
        let mut maintenance = RoutingMaintenance::new(true);
        let mut routing_table = RoutingTable::new(Id::random());
        let before = maintenance.last_table_refresh;

        // Add to Instant::now() instead of subtracting, Instant may be close to its epoch.
        let future = Instant::now() + REFRESH_TABLE_INTERVAL + Duration::from_secs(1);

        let decisions = maintenance.periodic_maintenance_decisions_at(future, &mut routing_table);

        assert!(decisions.should_populate);
        assert!(decisions.refresh_targets.is_empty());
        assert_eq!(maintenance.last_table_refresh, before);
    }

    #[test]
    fn refresh_due_updates_refresh_timer() {
        let mut maintenance = RoutingMaintenance::new(true);
        let mut routing_table = RoutingTable::new(Id::random());
        routing_table.note_contact(Contact::unique(1), true);

        let future = Instant::now() + REFRESH_TABLE_INTERVAL + Duration::from_secs(1);

        let decisions = maintenance.periodic_maintenance_decisions_at(future, &mut routing_table);

        assert!(decisions.should_populate);
        // A random target, plus the single bucket which went idle.
        assert_eq!(decisions.refresh_targets.len(), 2);
        assert_eq!(maintenance.last_table_refresh, future);

        let decisions = maintenance.periodic_maintenance_decisions_at(future, &mut routing_table);
        assert!(!decisions.should_populate);
        assert!(decisions.refresh_targets.is_empty());
    }

    #[test]
    fn random_lookup_disabled() {
        let mut maintenance = RoutingMaintenance::new(false);
        let mut routing_table = RoutingTable::new(Id::random());
        routing_table.note_contact(Contact::unique(1), true);

        let future = Instant::now() + REFRESH_TABLE_INTERVAL + Duration::from_secs(1);
        let decisions = maintenance.periodic_maintenance_decisions_at(future, &mut routing_table);

        assert_eq!(decisions.refresh_targets.len(), 1);
    }

    #[test]
    fn ping_failing_contacts() {
        let mut maintenance = RoutingMaintenance::new(true);
        let mut routing_table = RoutingTable::new(Id::random());

        let failing = Contact::unique(1);
        routing_table.note_contact(failing.clone(), true);
        routing_table.note_contact(Contact::unique(2), true);
        routing_table.note_failure(failing.id());

        let decisions =
            maintenance.periodic_maintenance_decisions_at(Instant::now(), &mut routing_table);
        assert!(decisions.contacts_to_ping.is_empty());
        assert!(!decisions.should_purge);

        let future = Instant::now() + PING_TABLE_INTERVAL + Duration::from_secs(1);
        let decisions = maintenance.periodic_maintenance_decisions_at(future, &mut routing_table);

        assert!(decisions.should_purge);
        assert_eq!(decisions.contacts_to_ping.len(), 1);
        assert_eq!(decisions.contacts_to_ping[0].id(), failing.id());
    }
}
