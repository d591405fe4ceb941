//! Escrow Ledger - journal-backed double-entry accounting
//!
//! ALL monetary mutations go through this service and produce journal
//! entries. The journal is the source of truth; wallet balances are a
//! materialised projection that [`EscrowLedger::verify_wallet`] can
//! re-derive at any time.
//!
//! # Invariants (hold after every operation)
//! 1. `available >= 0` and `locked >= 0` (unsigned, enforced by [`Balance`])
//! 2. Replaying a wallet's journal reproduces its current balances
//! 3. Paired `TradeDebit`/`TradeCredit` entries sharing a correlation id
//!    have zero net sum
//! 4. Journal entries are never modified or removed
//!
//! # Concurrency
//! One mutex serialises all mutations: every operation is single-wallet
//! or two-wallet atomic, and partial mutations are impossible because
//! preconditions are checked before any balance is touched.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

use crate::balance::Balance;
use crate::core_types::{AccountId, Clock, TimestampMs};
use crate::errors::{CoreError, CoreResult};

// ============================================================
// JOURNAL
// ============================================================

/// What kind of balance movement a journal entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Deposit,
    Withdrawal,
    EscrowLock,
    EscrowRelease,
    TradeDebit,
    TradeCredit,
    SettlementPayout,
    Fee,
}

/// What triggered a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Order,
    Trade,
    Market,
    External,
}

/// Causal reference carried by every journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRef {
    pub source: SourceType,
    pub id: u64,
}

impl EntryRef {
    pub fn order(id: u64) -> Self {
        Self { source: SourceType::Order, id }
    }
    pub fn trade(id: u64) -> Self {
        Self { source: SourceType::Trade, id }
    }
    pub fn market(id: u64) -> Self {
        Self { source: SourceType::Market, id }
    }
    pub fn external(id: u64) -> Self {
        Self { source: SourceType::External, id }
    }
}

/// Append-only audit record of one balance change.
///
/// `delta_cents` is the signed change to the primary field the kind
/// affects (e.g. a lock is negative: available decreased). The
/// `*_after` fields snapshot the projection so replays can be verified
/// entry by entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: u64,
    pub account: AccountId,
    pub kind: JournalKind,
    pub delta_cents: i64,
    pub available_after: u64,
    pub locked_after: u64,
    pub reference: EntryRef,
    /// Shared by the two halves of a paired transfer
    pub correlation_id: u64,
    pub ts: TimestampMs,
}

// ============================================================
// LEDGER SERVICE
// ============================================================

#[derive(Default)]
struct LedgerState {
    wallets: FxHashMap<AccountId, Balance>,
    journal: Vec<JournalEntry>,
    /// Accounts blocked from new commitments (lock/withdraw/deposit).
    /// Releases and settlement credits still go through so open
    /// obligations can unwind.
    frozen: FxHashSet<AccountId>,
    next_entry_id: u64,
    next_correlation_id: u64,
}

/// The escrow ledger. Shared across services behind `Arc`.
pub struct EscrowLedger {
    state: Mutex<LedgerState>,
    clock: Clock,
}

impl EscrowLedger {
    pub fn new(clock: Clock) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            clock,
        }
    }

    // ============================================================
    // QUERY OPERATIONS (read-only)
    // ============================================================

    /// (available, locked) for an account, if a wallet exists.
    pub fn balance_of(&self, account: AccountId) -> Option<(u64, u64)> {
        let state = self.state.lock().unwrap();
        state.wallets.get(&account).map(|b| (b.available(), b.locked()))
    }

    pub fn available(&self, account: AccountId) -> u64 {
        self.balance_of(account).map(|(a, _)| a).unwrap_or(0)
    }

    pub fn locked(&self, account: AccountId) -> u64 {
        self.balance_of(account).map(|(_, l)| l).unwrap_or(0)
    }

    pub fn journal_len(&self) -> usize {
        self.state.lock().unwrap().journal.len()
    }

    /// Snapshot of one account's journal entries, in append order.
    pub fn entries_for(&self, account: AccountId) -> Vec<JournalEntry> {
        let state = self.state.lock().unwrap();
        state
            .journal
            .iter()
            .filter(|e| e.account == account)
            .cloned()
            .collect()
    }

    /// Full journal snapshot (tests and audit tooling).
    pub fn journal_snapshot(&self) -> Vec<JournalEntry> {
        self.state.lock().unwrap().journal.clone()
    }

    /// Entries appended at or after `index`. Store-sync cursors page
    /// through the journal with this.
    pub fn entries_since(&self, index: usize) -> Vec<JournalEntry> {
        let state = self.state.lock().unwrap();
        state.journal.get(index..).unwrap_or(&[]).to_vec()
    }

    // ============================================================
    // WALLET LIFECYCLE
    // ============================================================

    /// Create a wallet. Idempotent on the account id; the opening
    /// balance is journalled as a deposit when non-zero.
    pub fn create_wallet(&self, account: AccountId, opening_cents: u64) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.wallets.contains_key(&account) {
            return Ok(());
        }
        state.wallets.insert(account, Balance::default());
        if opening_cents > 0 {
            Self::apply_deposit(&mut state, account, opening_cents, EntryRef::external(account), self.clock.now_ms())?;
        }
        Ok(())
    }

    pub fn has_wallet(&self, account: AccountId) -> bool {
        self.state.lock().unwrap().wallets.contains_key(&account)
    }

    /// Block an account from new commitments.
    pub fn freeze(&self, account: AccountId) {
        self.state.lock().unwrap().frozen.insert(account);
    }

    pub fn unfreeze(&self, account: AccountId) {
        self.state.lock().unwrap().frozen.remove(&account);
    }

    // ============================================================
    // SINGLE-WALLET OPERATIONS
    // ============================================================

    pub fn deposit(&self, account: AccountId, amount: u64, reference: EntryRef) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_not_frozen(&state, account)?;
        Self::apply_deposit(&mut state, account, amount, reference, self.clock.now_ms())
    }

    pub fn withdraw(&self, account: AccountId, amount: u64, reference: EntryRef) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_not_frozen(&state, account)?;
        let ts = self.clock.now_ms();
        let balance = Self::wallet_mut(&mut state, account)?;
        balance.withdraw(amount)?;
        let (available_after, locked_after) = (balance.available(), balance.locked());
        Self::append(
            &mut state,
            account,
            JournalKind::Withdrawal,
            -(amount as i64),
            available_after,
            locked_after,
            reference,
            None,
            ts,
        );
        Ok(())
    }

    /// Move `amount` from available to locked.
    ///
    /// Atomic: on `InsufficientFunds` nothing changes and nothing is
    /// journalled.
    pub fn lock(&self, account: AccountId, amount: u64, reference: EntryRef) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_not_frozen(&state, account)?;
        let ts = self.clock.now_ms();
        let balance = Self::wallet_mut(&mut state, account)?;
        balance.lock(amount)?;
        let (available_after, locked_after) = (balance.available(), balance.locked());
        Self::append(
            &mut state,
            account,
            JournalKind::EscrowLock,
            -(amount as i64),
            available_after,
            locked_after,
            reference,
            None,
            ts,
        );
        Ok(())
    }

    /// Inverse of [`lock`](Self::lock).
    ///
    /// # Errors
    /// `InvalidRelease` if `locked < amount`.
    pub fn release(&self, account: AccountId, amount: u64, reference: EntryRef) -> CoreResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        let ts = self.clock.now_ms();
        let balance = Self::wallet_mut(&mut state, account)?;
        balance.release(amount)?;
        let (available_after, locked_after) = (balance.available(), balance.locked());
        Self::append(
            &mut state,
            account,
            JournalKind::EscrowRelease,
            amount as i64,
            available_after,
            locked_after,
            reference,
            None,
            ts,
        );
        Ok(())
    }

    // ============================================================
    // TWO-WALLET OPERATIONS (paired entries, shared correlation id)
    // ============================================================

    /// Move funds from `from.locked` to `to.available`.
    ///
    /// Produces a `TradeDebit`/`TradeCredit` pair sharing a correlation
    /// id; the pair nets to zero. Trade settlement into the market
    /// escrow pool uses this primitive.
    pub fn transfer_locked(
        &self,
        from: AccountId,
        to: AccountId,
        amount: u64,
        reference: EntryRef,
    ) -> CoreResult<()> {
        self.paired_transfer(
            from,
            to,
            amount,
            reference,
            JournalKind::TradeDebit,
            JournalKind::TradeCredit,
            true,
        )
    }

    /// Pay out of a market escrow account's available funds.
    ///
    /// Produces a `SettlementPayout` pair sharing a correlation id.
    pub fn settlement_payout(
        &self,
        escrow: AccountId,
        to: AccountId,
        amount: u64,
        reference: EntryRef,
    ) -> CoreResult<()> {
        self.paired_transfer(
            escrow,
            to,
            amount,
            reference,
            JournalKind::SettlementPayout,
            JournalKind::SettlementPayout,
            false,
        )
    }

    /// Collect a fee from `from.locked` into the fee wallet's available.
    pub fn collect_fee(
        &self,
        from: AccountId,
        fee_wallet: AccountId,
        amount: u64,
        reference: EntryRef,
    ) -> CoreResult<()> {
        if amount == 0 {
            return Ok(());
        }
        self.paired_transfer(
            from,
            fee_wallet,
            amount,
            reference,
            JournalKind::Fee,
            JournalKind::Fee,
            true,
        )
    }

    fn paired_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: u64,
        reference: EntryRef,
        debit_kind: JournalKind,
        credit_kind: JournalKind,
        from_locked: bool,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let ts = self.clock.now_ms();

        // Validate both sides before touching either wallet
        if !state.wallets.contains_key(&to) {
            return Err(CoreError::LedgerInvariantViolated {
                account: to,
                detail: "transfer target has no wallet".into(),
            });
        }
        {
            let src = Self::wallet_mut(&mut state, from)?;
            let src_funds = if from_locked { src.locked() } else { src.available() };
            if src_funds < amount {
                return if from_locked {
                    Err(CoreError::InvalidRelease {
                        requested: amount,
                        locked: src_funds,
                    })
                } else {
                    Err(CoreError::InsufficientFunds {
                        needed: amount,
                        available: src_funds,
                    })
                };
            }
        }

        let correlation_id = state.next_correlation_id;
        state.next_correlation_id += 1;

        // Debit half
        let src = Self::wallet_mut(&mut state, from)?;
        if from_locked {
            src.spend_locked(amount)?;
        } else {
            src.withdraw(amount)?;
        }
        let (src_avail, src_locked) = (src.available(), src.locked());
        Self::append(
            &mut state,
            from,
            debit_kind,
            -(amount as i64),
            src_avail,
            src_locked,
            reference,
            Some(correlation_id),
            ts,
        );

        // Credit half
        let dst = Self::wallet_mut(&mut state, to)?;
        dst.deposit(amount)?;
        let (dst_avail, dst_locked) = (dst.available(), dst.locked());
        Self::append(
            &mut state,
            to,
            credit_kind,
            amount as i64,
            dst_avail,
            dst_locked,
            reference,
            Some(correlation_id),
            ts,
        );

        debug!(
            from,
            to, amount, ?debit_kind, correlation_id, "paired transfer"
        );
        Ok(())
    }

    // ============================================================
    // VERIFICATION
    // ============================================================

    /// Replay one wallet's journal and compare against its projection.
    ///
    /// # Errors
    /// `LedgerInvariantViolated` (fatal) on any mismatch.
    pub fn verify_wallet(&self, account: AccountId) -> CoreResult<()> {
        let state = self.state.lock().unwrap();
        let balance = state.wallets.get(&account).copied().unwrap_or_default();

        // i128 accumulators: a corrupt journal must surface as the fatal
        // error below, not as an arithmetic panic mid-replay.
        let mut avail: i128 = 0;
        let mut locked: i128 = 0;
        for entry in state.journal.iter().filter(|e| e.account == account) {
            let amount = entry.delta_cents.unsigned_abs() as i128;
            match entry.kind {
                JournalKind::Deposit | JournalKind::TradeCredit => avail += amount,
                JournalKind::Withdrawal => avail -= amount,
                JournalKind::EscrowLock => {
                    avail -= amount;
                    locked += amount;
                }
                JournalKind::EscrowRelease => {
                    locked -= amount;
                    avail += amount;
                }
                JournalKind::TradeDebit => locked -= amount,
                JournalKind::SettlementPayout => {
                    if entry.delta_cents < 0 {
                        avail -= amount;
                    } else {
                        avail += amount;
                    }
                }
                JournalKind::Fee => {
                    if entry.delta_cents < 0 {
                        locked -= amount;
                    } else {
                        avail += amount;
                    }
                }
            }
            if avail != entry.available_after as i128 || locked != entry.locked_after as i128 {
                return Err(CoreError::LedgerInvariantViolated {
                    account,
                    detail: format!(
                        "entry {} replay mismatch: ({avail}, {locked}) != ({}, {})",
                        entry.id, entry.available_after, entry.locked_after
                    ),
                });
            }
        }

        if avail != balance.available() as i128 || locked != balance.locked() as i128 {
            return Err(CoreError::LedgerInvariantViolated {
                account,
                detail: format!(
                    "projection mismatch: journal ({avail}, {locked}) != wallet ({}, {})",
                    balance.available(),
                    balance.locked()
                ),
            });
        }
        Ok(())
    }

    /// Verify every wallet against the journal.
    pub fn verify_all(&self) -> CoreResult<()> {
        let accounts: Vec<AccountId> = {
            let state = self.state.lock().unwrap();
            state.wallets.keys().copied().collect()
        };
        for account in accounts {
            self.verify_wallet(account)?;
        }
        Ok(())
    }

    // ============================================================
    // INTERNALS
    // ============================================================

    fn check_not_frozen(state: &LedgerState, account: AccountId) -> CoreResult<()> {
        if state.frozen.contains(&account) {
            return Err(CoreError::WalletFrozen(account));
        }
        Ok(())
    }

    fn wallet_mut(state: &mut LedgerState, account: AccountId) -> CoreResult<&mut Balance> {
        state
            .wallets
            .get_mut(&account)
            .ok_or(CoreError::UnknownAgent(account))
    }

    fn apply_deposit(
        state: &mut LedgerState,
        account: AccountId,
        amount: u64,
        reference: EntryRef,
        ts: TimestampMs,
    ) -> CoreResult<()> {
        let balance = Self::wallet_mut(state, account)?;
        balance.deposit(amount)?;
        let (available_after, locked_after) = (balance.available(), balance.locked());
        Self::append(
            state,
            account,
            JournalKind::Deposit,
            amount as i64,
            available_after,
            locked_after,
            reference,
            None,
            ts,
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn append(
        state: &mut LedgerState,
        account: AccountId,
        kind: JournalKind,
        delta_cents: i64,
        available_after: u64,
        locked_after: u64,
        reference: EntryRef,
        correlation: Option<u64>,
        ts: TimestampMs,
    ) {
        let id = state.next_entry_id;
        state.next_entry_id += 1;
        let correlation_id = correlation.unwrap_or_else(|| {
            let c = state.next_correlation_id;
            state.next_correlation_id += 1;
            c
        });
        state.journal.push(JournalEntry {
            id,
            account,
            kind,
            delta_cents,
            available_after,
            locked_after,
            reference,
            correlation_id,
            ts,
        });
    }
}

// ============================================================
// TESTS
// ============================================================
