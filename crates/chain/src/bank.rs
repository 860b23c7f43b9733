//! Read-side view of the Blueberry bank and core oracle.

use crate::contracts::bindings::Position;
use crate::error::ChainResult;
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Bank position identifier. Ids are assigned sequentially from 1.
pub type PositionId = u64;

/// Mirror of the bank's `Position` struct.
///
/// Field order follows `getPositionInfo`: owner, collToken,
/// underlyingToken, debtToken, underlyingVaultShare, debtShare, collId,
/// collateralSize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub owner: Address,
    /// Wrapper (ERC1155) holding the spell's strategy position.
    pub coll_token: Address,
    /// Isolated collateral token.
    pub underlying_token: Address,
    pub debt_token: Address,
    pub underlying_vault_share: U256,
    pub debt_share: U256,
    /// Wrapper token id. For ERC20 wrappers the low 160 bits are the farmed token.
    pub coll_id: U256,
    pub collateral_size: U256,
}

impl PositionInfo {
    /// A position is closed once nothing is left to seize or repay.
    pub fn is_closed(&self) -> bool {
        self.collateral_size.is_zero()
            && self.underlying_vault_share.is_zero()
            && self.debt_share.is_zero()
    }

    /// Whether the bank reports the position as fully liquidated
    /// (vault share, coll id and collateral size all cleared).
    pub fn is_liquidated(&self) -> bool {
        self.underlying_vault_share.is_zero()
            && self.coll_id.is_zero()
            && self.collateral_size.is_zero()
    }

    /// Token farmed by the wrapped strategy position, decoded from `coll_id`.
    pub fn farmed_token(&self) -> Address {
        let word = self.coll_id.to_be_bytes::<32>();
        Address::from_slice(&word[12..])
    }
}

impl From<Position> for PositionInfo {
    fn from(p: Position) -> Self {
        Self {
            owner: p.owner,
            coll_token: p.collToken,
            underlying_token: p.underlyingToken,
            debt_token: p.debtToken,
            underlying_vault_share: p.underlyingVaultShare,
            debt_share: p.debtShare,
            coll_id: p.collId,
            collateral_size: p.collateralSize,
        }
    }
}

/// Read ABI of the bank, the core oracle and ERC20 tokens.
///
/// Reads taking `at` are pinned to that block so that one snapshot never
/// mixes state from different heights.
#[async_trait]
pub trait BankReader: Send + Sync {
    async fn block_number(&self) -> ChainResult<u64>;

    async fn next_position_id(&self, at: u64) -> ChainResult<PositionId>;

    async fn position_info(&self, id: PositionId, at: u64) -> ChainResult<PositionInfo>;

    /// Debt token amount owed, interest included.
    async fn position_debt(&self, id: PositionId, at: u64) -> ChainResult<U256>;

    /// USD value (WAD) of the wrapped strategy position.
    async fn position_value(&self, id: PositionId, at: u64) -> ChainResult<U256>;

    /// USD value (WAD) of the isolated collateral.
    async fn isolated_collateral_value(&self, id: PositionId, at: u64) -> ChainResult<U256>;

    /// The bank's own verdict at the latest block.
    async fn is_liquidatable(&self, id: PositionId) -> ChainResult<bool>;

    /// Oracle USD price with 18 decimals.
    async fn price(&self, token: Address, at: u64) -> ChainResult<U256>;

    /// Liquidation threshold in basis points.
    async fn liquidation_threshold(&self, token: Address, at: u64) -> ChainResult<u32>;

    async fn decimals(&self, token: Address) -> ChainResult<u8>;

    /// ERC20 balance, at `block` or latest.
    async fn balance_of(
        &self,
        token: Address,
        holder: Address,
        block: Option<u64>,
    ) -> ChainResult<U256>;
}
