use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use parkrpc_common::{LotError, ParkrpcError, Result};

/// Cars enter a lot on this level, and may only exit from it.
pub const ENTRY_LEVEL: u32 = 1;

/// Static description of one lot: per-level capacities, level 1 first.
#[derive(Debug, Clone)]
pub struct LotSpec {
    pub number: u32,
    pub levels: Vec<u32>,
}

impl LotSpec {
    pub fn new(number: u32, levels: Vec<u32>) -> Self {
        Self { number, levels }
    }

    /// Uniform layout helper used by the CLI and tests.
    pub fn uniform(number: u32, levels: u32, capacity: u32) -> Self {
        Self::new(number, vec![capacity; levels as usize])
    }
}

#[derive(Debug)]
struct LevelState {
    capacity: u32,
    car_count: u32,
}

#[derive(Debug)]
struct LotState {
    capacity: u32,
    car_count: u32,
    levels: Vec<LevelState>,
}

impl LotState {
    fn new(spec: &LotSpec) -> Self {
        Self {
            capacity: spec.levels.iter().sum(),
            car_count: 0,
            levels: spec
                .levels
                .iter()
                .map(|&capacity| LevelState {
                    capacity,
                    car_count: 0,
                })
                .collect(),
        }
    }

    fn available_levels(&self) -> Vec<u32> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, level)| level.car_count < level.capacity)
            .map(|(i, _)| i as u32 + 1)
            .collect()
    }

    fn top_level(&self) -> u32 {
        self.levels.len() as u32
    }
}

/// One ledger row: the client's highest applied sequence number together
/// with its last known position. Created on session creation, never deleted
/// while the session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRow {
    pub seq: u64,
    pub lot: Option<u32>,
    pub level: Option<u32>,
}

#[derive(Debug)]
struct StoreInner {
    lots: BTreeMap<u32, LotState>,
    clients: BTreeMap<u64, ClientRow>,
    next_client_id: u64,
}

/// One node's connection to the persistence engine: lot occupancy plus the
/// per-client idempotency ledger.
///
/// The engine itself is shared: every handle produced by [`attach`] sees the
/// same lots and ledger rows (the nodes of one deployment all talk to one
/// database), while `inject_failure` severs only this handle's connection,
/// so one node can lose its store without taking the others down.
///
/// Every operation runs under one lock acquisition, which is the store's
/// transaction boundary: the ledger row update and the occupancy mutation it
/// guards are observed together or not at all.
///
/// [`attach`]: LotStore::attach
pub struct LotStore {
    inner: Arc<Mutex<StoreInner>>,
    severed: AtomicBool,
}

impl LotStore {
    pub fn new(specs: Vec<LotSpec>) -> Self {
        let lots = specs
            .iter()
            .map(|spec| (spec.number, LotState::new(spec)))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                lots,
                clients: BTreeMap::new(),
                next_client_id: 1,
            })),
            severed: AtomicBool::new(false),
        }
    }

    /// A fresh connection to the same engine, with its own failure state.
    pub fn attach(&self) -> LotStore {
        LotStore {
            inner: Arc::clone(&self.inner),
            severed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>> {
        if self.severed.load(Ordering::SeqCst) {
            return Err(ParkrpcError::ServiceUnavailable(
                "Store connection is severed".to_string(),
            ));
        }
        self.inner
            .lock()
            .map_err(|_| ParkrpcError::ServiceUnavailable("Store lock poisoned".to_string()))
    }

    /// Health probe: succeeds iff this connection can still serve.
    pub fn probe(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    /// Severs this handle's connection. Used for fault injection.
    pub fn inject_failure(&self) {
        self.severed.store(true, Ordering::SeqCst);
    }

    /// Creates a fresh client row and returns its identity.
    pub fn create_client(&self) -> Result<u64> {
        let mut inner = self.lock()?;
        let client_id = inner.next_client_id;
        inner.next_client_id += 1;
        inner.clients.insert(
            client_id,
            ClientRow {
                seq: 0,
                lot: None,
                level: None,
            },
        );
        debug!(client_id, "client row created");
        Ok(client_id)
    }

    /// Loads an existing client row, failing when the identity is unknown.
    pub fn resume_client(&self, client_id: u64) -> Result<ClientRow> {
        let inner = self.lock()?;
        inner
            .clients
            .get(&client_id)
            .copied()
            .ok_or(ParkrpcError::UnknownClient(client_id))
    }

    /// Moves the client's car into `lot` and returns the levels that still
    /// have space.
    ///
    /// A sequence number at or below the ledger row's is a redelivery: the
    /// reply is recomputed and returned without side effects.
    pub fn enter_lot(&self, client_id: u64, seq: u64, lot: u32) -> Result<Vec<u32>> {
        let mut inner = self.lock()?;
        let row = *inner
            .clients
            .get(&client_id)
            .ok_or(ParkrpcError::UnknownClient(client_id))?;
        if !inner.lots.contains_key(&lot) {
            return Err(LotError::LotNotFound(lot).into());
        }

        if row.seq >= seq {
            debug!(client_id, seq, "duplicate enter_lot; returning prior result");
            return Ok(inner.lots[&lot].available_levels());
        }

        if let Some(current) = row.lot {
            return Err(LotError::AlreadyInLot(current).into());
        }

        let lot_state = inner.lots.get_mut(&lot).expect("lot presence checked");
        if lot_state.car_count >= lot_state.capacity {
            return Err(LotError::LotFull(lot).into());
        }
        lot_state.car_count += 1;
        lot_state.levels[(ENTRY_LEVEL - 1) as usize].car_count += 1;
        let available = lot_state.available_levels();

        let row = inner.clients.get_mut(&client_id).expect("row checked");
        row.lot = Some(lot);
        row.level = Some(ENTRY_LEVEL);
        row.seq = seq;
        Ok(available)
    }

    /// Removes the client's car from its current lot.
    pub fn exit_lot(&self, client_id: u64, seq: u64) -> Result<()> {
        let mut inner = self.lock()?;
        let row = *inner
            .clients
            .get(&client_id)
            .ok_or(ParkrpcError::UnknownClient(client_id))?;

        if row.seq >= seq {
            debug!(client_id, seq, "duplicate exit_lot; returning prior result");
            return Ok(());
        }

        let lot = row.lot.ok_or(LotError::NotInLot)?;
        let level = row.level.unwrap_or(ENTRY_LEVEL);
        if level != ENTRY_LEVEL {
            return Err(LotError::NotOnExitLevel.into());
        }

        let lot_state = inner.lots.get_mut(&lot).expect("row references a known lot");
        lot_state.car_count = lot_state.car_count.saturating_sub(1);
        lot_state.levels[(level - 1) as usize].car_count = lot_state.levels
            [(level - 1) as usize]
            .car_count
            .saturating_sub(1);

        let row = inner.clients.get_mut(&client_id).expect("row checked");
        row.lot = None;
        row.level = None;
        row.seq = seq;
        Ok(())
    }

    /// Moves the car one level up and returns the new level.
    pub fn move_up_level(&self, client_id: u64, seq: u64) -> Result<u32> {
        self.move_level(client_id, seq, 1)
    }

    /// Moves the car one level down and returns the new level.
    pub fn move_down_level(&self, client_id: u64, seq: u64) -> Result<u32> {
        self.move_level(client_id, seq, -1)
    }

    fn move_level(&self, client_id: u64, seq: u64, direction: i32) -> Result<u32> {
        let mut inner = self.lock()?;
        let row = *inner
            .clients
            .get(&client_id)
            .ok_or(ParkrpcError::UnknownClient(client_id))?;

        if row.seq >= seq {
            debug!(client_id, seq, "duplicate level move; returning prior result");
            return row.level.ok_or_else(|| LotError::NotInLot.into());
        }

        let lot = row.lot.ok_or(LotError::NotInLot)?;
        let level = row.level.unwrap_or(ENTRY_LEVEL);
        let lot_state = inner.lots.get_mut(&lot).expect("row references a known lot");

        let new_level = if direction > 0 {
            if level >= lot_state.top_level() {
                return Err(LotError::AtTopLevel.into());
            }
            level + 1
        } else {
            if level <= ENTRY_LEVEL {
                return Err(LotError::AtBottomLevel.into());
            }
            level - 1
        };

        lot_state.levels[(level - 1) as usize].car_count = lot_state.levels
            [(level - 1) as usize]
            .car_count
            .saturating_sub(1);
        lot_state.levels[(new_level - 1) as usize].car_count += 1;

        let row = inner.clients.get_mut(&client_id).expect("row checked");
        row.level = Some(new_level);
        row.seq = seq;
        Ok(new_level)
    }

    /// Current level of the client's car.
    pub fn current_level(&self, client_id: u64) -> Result<u32> {
        let inner = self.lock()?;
        let row = inner
            .clients
            .get(&client_id)
            .ok_or(ParkrpcError::UnknownClient(client_id))?;
        row.level.ok_or_else(|| LotError::NotInLot.into())
    }

    /// Top level number of the client's current lot.
    pub fn max_level(&self, client_id: u64) -> Result<u32> {
        let inner = self.lock()?;
        let row = inner
            .clients
            .get(&client_id)
            .ok_or(ParkrpcError::UnknownClient(client_id))?;
        let lot = row.lot.ok_or(LotError::NotInLot)?;
        Ok(inner.lots[&lot].top_level())
    }

    /// Bottom level number of the client's current lot.
    pub fn min_level(&self, client_id: u64) -> Result<u32> {
        let inner = self.lock()?;
        let row = inner
            .clients
            .get(&client_id)
            .ok_or(ParkrpcError::UnknownClient(client_id))?;
        row.lot.ok_or(LotError::NotInLot)?;
        Ok(ENTRY_LEVEL)
    }

    /// All lot numbers known to the system, ascending.
    pub fn lots(&self) -> Result<Vec<u32>> {
        let inner = self.lock()?;
        Ok(inner.lots.keys().copied().collect())
    }

    /// Other lots with free space, sorted by distance from `from` with
    /// closer lots first.
    pub fn other_lot_availability(&self, from: u32) -> Result<Vec<u32>> {
        let inner = self.lock()?;
        if !inner.lots.contains_key(&from) {
            return Err(LotError::LotNotFound(from).into());
        }
        let mut available: Vec<u32> = inner
            .lots
            .iter()
            .filter(|(&number, state)| number != from && state.car_count < state.capacity)
            .map(|(&number, _)| number)
            .collect();
        available.sort_by_key(|&number| (number.abs_diff(from), number));
        Ok(available)
    }

    /// Closes a session. The ledger row deliberately stays: a later
    /// `resume_session` with this identity must still be answerable.
    pub fn close_client(&self, client_id: u64) -> Result<()> {
        let inner = self.lock()?;
        if !inner.clients.contains_key(&client_id) {
            return Err(ParkrpcError::UnknownClient(client_id));
        }
        Ok(())
    }

    /// Cars currently in the given lot. Test/diagnostic helper.
    pub fn lot_occupancy(&self, lot: u32) -> Result<u32> {
        let inner = self.lock()?;
        inner
            .lots
            .get(&lot)
            .map(|state| state.car_count)
            .ok_or_else(|| LotError::LotNotFound(lot).into())
    }
}
