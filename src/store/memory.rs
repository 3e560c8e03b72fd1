use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{StaffTxn, Store, StoreError};

pub type SharedStaffBookings = Arc<RwLock<StaffBookings>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while one fsync is in flight are
/// written together and share the next fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Store state ──────────────────────────────────────────

struct Inner {
    staff: DashMap<Ulid, SharedStaffBookings>,
    /// staff id → every rule of that staff member
    rules: DashMap<Ulid, Vec<WorkingHoursRule>>,
    rule_to_staff: DashMap<Ulid, Ulid>,
    services: DashMap<Ulid, ServiceDefinition>,
    businesses: DashMap<Ulid, Business>,
    clients: DashMap<Ulid, Client>,
    /// Committed bookings by id. Written only under the log gate, so
    /// compaction can read it without any staff lock.
    committed: DashMap<Ulid, Booking>,
    /// Appends hold this shared; compaction holds it exclusively so the
    /// snapshot and the log agree.
    log_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Inner {
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    fn staff_state(&self, staff_id: Ulid) -> SharedStaffBookings {
        self.staff
            .entry(staff_id)
            .or_insert_with(|| Arc::new(RwLock::new(StaffBookings::new(staff_id))))
            .value()
            .clone()
    }

    /// Snapshot of every staff booking set, so no map guard is held across an await.
    fn staff_snapshot(&self) -> Vec<(Ulid, SharedStaffBookings)> {
        let mut all: Vec<_> = self
            .staff
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// Apply a configuration event (anything that is not a booking-set change).
    fn apply_config(&self, event: &Event) {
        match event {
            Event::BusinessRegistered { id, name } => {
                self.businesses.insert(
                    *id,
                    Business {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::ClientRegistered {
                id,
                email,
                first_name,
            } => {
                self.clients.insert(
                    *id,
                    Client {
                        id: *id,
                        email: email.clone(),
                        first_name: first_name.clone(),
                    },
                );
            }
            Event::ServiceDefined {
                id,
                business_id,
                name,
                duration_min,
            } => {
                self.services.insert(
                    *id,
                    ServiceDefinition {
                        id: *id,
                        business_id: *business_id,
                        name: name.clone(),
                        duration_min: *duration_min,
                    },
                );
            }
            Event::WorkingHoursSet {
                id,
                staff_id,
                day_of_week,
                start_time,
                end_time,
                is_break,
            } => {
                let rule = WorkingHoursRule {
                    id: *id,
                    staff_id: *staff_id,
                    day_of_week: *day_of_week,
                    start_time: *start_time,
                    end_time: *end_time,
                    is_break: *is_break,
                };
                let mut rules = self.rules.entry(*staff_id).or_default();
                rules.retain(|r| r.id != *id);
                rules.push(rule);
                self.rule_to_staff.insert(*id, *staff_id);
            }
            Event::WorkingHoursRemoved { id, staff_id } => {
                if let Some(mut rules) = self.rules.get_mut(staff_id) {
                    rules.retain(|r| r.id != *id);
                }
                self.rule_to_staff.remove(id);
            }
            Event::BookingsAdmitted { .. } | Event::BookingCancelled { .. } => {}
        }
    }

    /// Apply a booking-set event to a staff member's bookings (caller holds the write lock).
    fn apply_to_staff(&self, sb: &mut StaffBookings, event: &Event) {
        match event {
            Event::BookingsAdmitted { bookings, .. } => {
                for booking in bookings {
                    self.committed.insert(booking.id, booking.clone());
                    sb.insert(booking.clone());
                }
            }
            Event::BookingCancelled { id, .. } => {
                if let Some(booking) = sb.get_mut(*id) {
                    booking.status = BookingStatus::Cancelled;
                }
                if let Some(mut booking) = self.committed.get_mut(id) {
                    booking.status = BookingStatus::Cancelled;
                }
            }
            _ => {}
        }
    }

    /// Durably log a configuration event, then apply it.
    async fn persist_config(&self, event: Event) -> Result<(), StoreError> {
        let _gate = self.log_gate.read().await;
        self.wal_append(&event).await?;
        self.apply_config(&event);
        Ok(())
    }
}

fn event_staff_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingsAdmitted { staff_id, .. } | Event::BookingCancelled { staff_id, .. } => {
            Some(*staff_id)
        }
        _ => None,
    }
}

fn check_name(name: &str, what: &'static str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Invalid(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// WAL-backed in-memory implementation of [`Store`].
///
/// Each staff member's bookings live behind their own `RwLock`; a
/// transaction holds the write half, which serialises admissions per staff
/// member while leaving other staff members untouched.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Replay the log at `wal_path` and start its writer task. Must run inside a Tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = Inner {
            staff: DashMap::new(),
            rules: DashMap::new(),
            rule_to_staff: DashMap::new(),
            services: DashMap::new(),
            businesses: DashMap::new(),
            clients: DashMap::new(),
            committed: DashMap::new(),
            log_gate: RwLock::new(()),
            wal_tx,
        };

        // We own every lock here, so try_write cannot contend. Never block:
        // this may run inside an async context.
        for event in &events {
            match event_staff_id(event) {
                Some(staff_id) => {
                    let state = inner.staff_state(staff_id);
                    match state.try_write() {
                        Ok(mut guard) => inner.apply_to_staff(&mut guard, event),
                        Err(_) => warn!("replay: staff {staff_id} unexpectedly locked"),
                    }
                }
                None => inner.apply_config(event),
            }
        }
        info!(
            "store replayed {} events from {}",
            events.len(),
            wal_path.display()
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // ── Out-of-band configuration ────────────────────────────

    pub async fn register_business(&self, business: Business) -> Result<(), StoreError> {
        check_name(&business.name, "business name")?;
        if self.inner.businesses.contains_key(&business.id) {
            return Err(StoreError::AlreadyExists(business.id));
        }
        self.inner
            .persist_config(Event::BusinessRegistered {
                id: business.id,
                name: business.name,
            })
            .await
    }

    pub async fn register_client(&self, client: Client) -> Result<(), StoreError> {
        check_name(&client.first_name, "first name")?;
        if client.email.len() > MAX_EMAIL_LEN {
            return Err(StoreError::LimitExceeded("email too long"));
        }
        if !client.email.contains('@') {
            return Err(StoreError::Invalid(format!("bad email: {}", client.email)));
        }
        if self.inner.clients.contains_key(&client.id) {
            return Err(StoreError::AlreadyExists(client.id));
        }
        self.inner
            .persist_config(Event::ClientRegistered {
                id: client.id,
                email: client.email,
                first_name: client.first_name,
            })
            .await
    }

    pub async fn define_service(&self, service: ServiceDefinition) -> Result<(), StoreError> {
        check_name(&service.name, "service name")?;
        if service.duration_min == 0 {
            return Err(StoreError::Invalid("service duration must be positive".into()));
        }
        if service.duration_min > MAX_SERVICE_DURATION_MIN {
            return Err(StoreError::LimitExceeded("service duration too long"));
        }
        if !self.inner.businesses.contains_key(&service.business_id) {
            return Err(StoreError::NotFound(service.business_id));
        }
        if self.inner.services.contains_key(&service.id) {
            return Err(StoreError::AlreadyExists(service.id));
        }
        self.inner
            .persist_config(Event::ServiceDefined {
                id: service.id,
                business_id: service.business_id,
                name: service.name,
                duration_min: service.duration_min,
            })
            .await
    }

    /// Insert or replace a working-hours rule (keyed by rule id).
    pub async fn set_working_hours(&self, rule: WorkingHoursRule) -> Result<(), StoreError> {
        if rule.day_of_week > 6 {
            return Err(StoreError::Invalid(format!(
                "day_of_week {} out of range 0..=6",
                rule.day_of_week
            )));
        }
        if rule.start_time >= rule.end_time {
            return Err(StoreError::Invalid(format!(
                "start {} must be before end {}",
                rule.start_time, rule.end_time
            )));
        }
        if let Some(owner) = self.inner.rule_to_staff.get(&rule.id)
            && *owner != rule.staff_id
        {
            return Err(StoreError::AlreadyExists(rule.id));
        }
        let existing = self
            .inner
            .rules
            .get(&rule.staff_id)
            .map_or(0, |rules| rules.iter().filter(|r| r.id != rule.id).count());
        if existing >= MAX_RULES_PER_STAFF {
            return Err(StoreError::LimitExceeded("too many working-hours rules"));
        }
        self.inner
            .persist_config(Event::WorkingHoursSet {
                id: rule.id,
                staff_id: rule.staff_id,
                day_of_week: rule.day_of_week,
                start_time: rule.start_time,
                end_time: rule.end_time,
                is_break: rule.is_break,
            })
            .await
    }

    pub async fn remove_working_hours(&self, id: Ulid) -> Result<Ulid, StoreError> {
        let staff_id = self
            .inner
            .rule_to_staff
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        self.inner
            .persist_config(Event::WorkingHoursRemoved { id, staff_id })
            .await?;
        Ok(staff_id)
    }

    /// Mark a booking CANCELLED. The record stays for history; cancelling twice is a no-op.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        let staff_id = self
            .inner
            .committed
            .get(&id)
            .map(|e| e.staff_id)
            .ok_or(StoreError::NotFound(id))?;
        let state = self.inner.staff_state(staff_id);
        let mut guard = state.write().await;
        let current = guard
            .bookings
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        if !current.is_active() {
            return Ok(current);
        }

        let event = Event::BookingCancelled { id, staff_id };
        let _gate = self.inner.log_gate.read().await;
        self.inner.wal_append(&event).await?;
        self.inner.apply_to_staff(&mut guard, &event);
        debug!("cancelled booking {id} for staff {staff_id}");
        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..current
        })
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the log as the minimal event list that recreates current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        // Every append and its apply run under the gate's read half, so with
        // the write half held the in-memory state matches the log exactly.
        let _gate = self.inner.log_gate.write().await;

        let mut events = Vec::new();
        events.extend(self.inner.businesses.iter().map(|e| Event::BusinessRegistered {
            id: e.id,
            name: e.name.clone(),
        }));
        events.extend(self.inner.clients.iter().map(|e| Event::ClientRegistered {
            id: e.id,
            email: e.email.clone(),
            first_name: e.first_name.clone(),
        }));
        events.extend(self.inner.services.iter().map(|e| Event::ServiceDefined {
            id: e.id,
            business_id: e.business_id,
            name: e.name.clone(),
            duration_min: e.duration_min,
        }));
        for entry in self.inner.rules.iter() {
            events.extend(entry.value().iter().map(|r| Event::WorkingHoursSet {
                id: r.id,
                staff_id: r.staff_id,
                day_of_week: r.day_of_week,
                start_time: r.start_time,
                end_time: r.end_time,
                is_break: r.is_break,
            }));
        }
        let mut by_staff: BTreeMap<Ulid, Vec<Booking>> = BTreeMap::new();
        for entry in self.inner.committed.iter() {
            by_staff
                .entry(entry.staff_id)
                .or_default()
                .push(entry.value().clone());
        }
        for (staff_id, mut bookings) in by_staff {
            bookings.sort_by_key(|b| (b.span.start, b.id));
            events.push(Event::BookingsAdmitted { staff_id, bookings });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    /// Hold the log gate exclusively, stalling every durable write until dropped.
    #[cfg(test)]
    pub(crate) async fn pause_log(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.inner.log_gate.write().await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Background task: compact the WAL once `threshold` appends have accumulated.
pub async fn run_compactor(store: InMemoryStore, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = store.compact().await {
            warn!("WAL compaction failed after {appends} appends: {e}");
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Txn = MemoryTxn;

    async fn service(&self, id: Ulid) -> Result<Option<ServiceDefinition>, StoreError> {
        Ok(self.inner.services.get(&id).map(|e| e.value().clone()))
    }

    async fn business(&self, id: Ulid) -> Result<Option<Business>, StoreError> {
        Ok(self.inner.businesses.get(&id).map(|e| e.value().clone()))
    }

    async fn client(&self, id: Ulid) -> Result<Option<Client>, StoreError> {
        Ok(self.inner.clients.get(&id).map(|e| e.value().clone()))
    }

    async fn working_hours(
        &self,
        staff_id: Ulid,
        day_of_week: u8,
    ) -> Result<Vec<WorkingHoursRule>, StoreError> {
        let mut rules: Vec<WorkingHoursRule> = self
            .inner
            .rules
            .get(&staff_id)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| r.day_of_week == day_of_week)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rules.sort_by_key(|r| (r.start_time, r.end_time));
        Ok(rules)
    }

    async fn active_bookings(
        &self,
        staff_id: Ulid,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        let Some(state) = self.inner.staff.get(&staff_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = state.read().await;
        Ok(guard.overlapping(&window).cloned().collect())
    }

    async fn bookings_for_client(&self, client_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        let mut found = Vec::new();
        for (_, state) in self.inner.staff_snapshot() {
            let guard = state.read().await;
            found.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.client_id == client_id)
                    .cloned(),
            );
        }
        found.sort_by(|a, b| b.span.start.cmp(&a.span.start));
        Ok(found)
    }

    async fn bookings_for_business(
        &self,
        business_id: Ulid,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(StoreError::LimitExceeded("query window too wide"));
        }
        let mut found = Vec::new();
        for (_, state) in self.inner.staff_snapshot() {
            let guard = state.read().await;
            found.extend(
                guard
                    .overlapping(&window)
                    .filter(|b| b.business_id == business_id && window.contains_span(&b.span))
                    .cloned(),
            );
        }
        found.sort_by_key(|b| (b.span.start, b.id));
        Ok(found)
    }

    async fn begin(&self, staff_id: Ulid) -> Result<MemoryTxn, StoreError> {
        let guard = self.inner.staff_state(staff_id).write_owned().await;
        Ok(MemoryTxn {
            inner: self.inner.clone(),
            guard,
            staged: Vec::new(),
        })
    }
}

/// Exclusive hold on one staff member's bookings. Dropping it without
/// `commit` releases the lock and discards whatever was staged.
pub struct MemoryTxn {
    inner: Arc<Inner>,
    guard: OwnedRwLockWriteGuard<StaffBookings>,
    staged: Vec<Booking>,
}

impl MemoryTxn {
    fn collision(&self, span: &Span) -> Option<&Booking> {
        self.guard.overlapping(span).next().or_else(|| {
            self.staged
                .iter()
                .find(|b| b.is_active() && b.span.overlaps(span))
        })
    }
}

#[async_trait]
impl StaffTxn for MemoryTxn {
    async fn find_collision(&mut self, span: Span) -> Result<Option<Booking>, StoreError> {
        Ok(self.collision(&span).cloned())
    }

    async fn insert(&mut self, booking: Booking) -> Result<(), StoreError> {
        if booking.staff_id != self.guard.staff_id {
            return Err(StoreError::Invalid(format!(
                "booking for staff {} inserted into transaction for staff {}",
                booking.staff_id, self.guard.staff_id
            )));
        }
        if booking.span.start < MIN_VALID_TIMESTAMP_MS || booking.span.end > MAX_VALID_TIMESTAMP_MS
        {
            return Err(StoreError::LimitExceeded("timestamp out of range"));
        }
        if self.guard.bookings.len() + self.staged.len() >= MAX_BOOKINGS_PER_STAFF {
            return Err(StoreError::LimitExceeded("too many bookings for staff member"));
        }
        if booking.is_active()
            && let Some(existing) = self.collision(&booking.span)
        {
            return Err(StoreError::Conflict(existing.id));
        }
        self.staged.push(booking);
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        // Run the durable write in its own task: if the caller gives up
        // mid-commit the booking is still either fully applied or absent.
        let handle = tokio::spawn(async move {
            let MemoryTxn {
                inner,
                mut guard,
                staged,
            } = self;
            let event = Event::BookingsAdmitted {
                staff_id: guard.staff_id,
                bookings: staged,
            };
            let _gate = inner.log_gate.read().await;
            inner.wal_append(&event).await?;
            inner.apply_to_staff(&mut guard, &event);
            Ok(())
        });
        handle
            .await
            .map_err(|e| StoreError::Aborted(e.to_string()))?
    }
}
