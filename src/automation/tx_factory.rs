//! Unsigned transaction construction
//!
//! Instructions come from the SDK builders (`system_instruction`, `spl_token`,
//! `ComputeBudgetInstruction`); venue calls use an 8-byte Anchor-style
//! discriminator followed by the little-endian amount.

use sha2::{Digest, Sha256};
use solana_sdk::{
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    message::{v0::Message as MessageV0, VersionedMessage},
    pubkey::Pubkey,
    system_instruction, system_program,
};
use spl_associated_token_account::get_associated_token_address;
use std::str::FromStr;

use super::errors::OrchestrationError;
use super::work_unit::{AutomationKind, LifecycleStage};
use crate::config::{parse_pubkey, VenueSettings};
use crate::ledger::fixed_point::FixedAmount;

const PRE_GRADUATION_IX: &str = "add_liquidity";
const POST_GRADUATION_IX: &str = "deposit";

/// What to build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub kind: AutomationKind,
    pub stage: LifecycleStage,
    pub amount: FixedAmount,
    pub mint: Pubkey,
    pub payer: Pubkey,
    pub destination: Option<String>,
    /// Token decimals, required for burns
    pub decimals: Option<u8>,
}

pub trait TransactionFactory: Send + Sync {
    /// Messages ready to sign, in bundle order
    fn build(&self, request: &BuildRequest, blockhash: Hash) -> Result<Vec<VersionedMessage>, OrchestrationError>;
}

/// First 8 bytes of `sha256("global:<name>")`
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("global:{}", name).as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

#[derive(Debug, Clone)]
pub struct VenueTransactionFactory {
    pre_graduation_program: Pubkey,
    post_graduation_program: Pubkey,
    compute_unit_limit: u32,
    compute_unit_price: u64,
    tip: Option<(Pubkey, u64)>,
}

impl VenueTransactionFactory {
    pub fn from_settings(settings: &VenueSettings) -> Result<Self, crate::config::ConfigError> {
        let tip = match &settings.tip_account {
            Some(account) if settings.tip_lamports > 0 => {
                Some((parse_pubkey("venue.tip_account", account)?, settings.tip_lamports))
            }
            _ => None,
        };
        Ok(Self {
            pre_graduation_program: parse_pubkey(
                "venue.pre_graduation_program",
                &settings.pre_graduation_program,
            )?,
            post_graduation_program: parse_pubkey(
                "venue.post_graduation_program",
                &settings.post_graduation_program,
            )?,
            compute_unit_limit: settings.compute_unit_limit,
            compute_unit_price: settings.compute_unit_price_micro_lamports,
            tip,
        })
    }

    fn venue_instruction(&self, request: &BuildRequest) -> Result<Instruction, OrchestrationError> {
        let (program, name) = match request.stage {
            LifecycleStage::PreGraduation => (self.pre_graduation_program, PRE_GRADUATION_IX),
            LifecycleStage::PostGraduation => (self.post_graduation_program, POST_GRADUATION_IX),
        };
        let lamports = lamports(request.amount)?;
        let mut data = instruction_discriminator(name).to_vec();
        data.extend_from_slice(&lamports.to_le_bytes());

        Ok(Instruction {
            program_id: program,
            accounts: vec![
                AccountMeta::new(request.payer, true),
                AccountMeta::new_readonly(request.mint, false),
                AccountMeta::new(get_associated_token_address(&request.payer, &request.mint), false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data,
        })
    }

    fn action_instruction(&self, request: &BuildRequest) -> Result<Instruction, OrchestrationError> {
        match request.kind {
            AutomationKind::LiquidityTopUp => self.venue_instruction(request),
            AutomationKind::FeeHarvest => {
                let raw = request
                    .destination
                    .as_deref()
                    .ok_or_else(|| OrchestrationError::InvalidDestination("no destination configured".into()))?;
                let destination = Pubkey::from_str(raw.trim())
                    .map_err(|e| OrchestrationError::InvalidDestination(format!("{}: {}", raw, e)))?;
                if destination == request.payer {
                    return Err(OrchestrationError::InvalidDestination(
                        "destination equals funding wallet".into(),
                    ));
                }
                Ok(system_instruction::transfer(&request.payer, &destination, lamports(request.amount)?))
            }
            AutomationKind::TokenBurn => {
                let decimals = request
                    .decimals
                    .ok_or_else(|| OrchestrationError::Build("token decimals unknown".into()))?;
                let raw = request
                    .amount
                    .to_base_units(decimals)
                    .filter(|r| *r > 0)
                    .ok_or_else(|| OrchestrationError::Build(format!("invalid burn amount {}", request.amount)))?;
                let account = get_associated_token_address(&request.payer, &request.mint);
                spl_token::instruction::burn(
                    &spl_token::id(),
                    &account,
                    &request.mint,
                    &request.payer,
                    &[],
                    raw,
                )
                .map_err(|e| OrchestrationError::Build(e.to_string()))
            }
        }
    }
}

fn lamports(amount: FixedAmount) -> Result<u64, OrchestrationError> {
    amount
        .to_lamports()
        .filter(|l| *l > 0)
        .ok_or_else(|| OrchestrationError::Build(format!("invalid lamport amount {}", amount)))
}

impl TransactionFactory for VenueTransactionFactory {
    fn build(&self, request: &BuildRequest, blockhash: Hash) -> Result<Vec<VersionedMessage>, OrchestrationError> {
        let mut instructions = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(self.compute_unit_limit),
            ComputeBudgetInstruction::set_compute_unit_price(self.compute_unit_price),
            self.action_instruction(request)?,
        ];
        // Tip goes last so it only pays if everything before it succeeded
        if let Some((account, tip_lamports)) = self.tip {
            instructions.push(system_instruction::transfer(&request.payer, &account, tip_lamports));
        }

        let message = MessageV0::try_compile(&request.payer, &instructions, &[], blockhash)
            .map_err(|e| OrchestrationError::Build(e.to_string()))?;
        Ok(vec![VersionedMessage::V0(message)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(tip: Option<(Pubkey, u64)>) -> VenueTransactionFactory {
        VenueTransactionFactory {
            pre_graduation_program: Pubkey::new_unique(),
            post_graduation_program: Pubkey::new_unique(),
            compute_unit_limit: 200_000,
            compute_unit_price: 1_000,
            tip,
        }
    }

    fn request(kind: AutomationKind) -> BuildRequest {
        BuildRequest {
            kind,
            stage: LifecycleStage::PreGraduation,
            amount: FixedAmount::from_f64(0.2),
            mint: Pubkey::new_unique(),
            payer: Pubkey::new_unique(),
            destination: None,
            decimals: Some(6),
        }
    }

    fn instructions(msg: &VersionedMessage) -> Vec<(Pubkey, Vec<u8>)> {
        let keys = msg.static_account_keys();
        msg.instructions()
            .iter()
            .map(|ix| (keys[ix.program_id_index as usize], ix.data.clone()))
            .collect()
    }

    #[test]
    fn test_top_up_routes_by_stage() {
        let f = factory(None);
        let mut req = request(AutomationKind::LiquidityTopUp);
        let pre = f.build(&req, Hash::default()).unwrap();
        let ixs = instructions(&pre[0]);
        assert_eq!(ixs[2].0, f.pre_graduation_program);
        assert_eq!(&ixs[2].1[..8], &instruction_discriminator(PRE_GRADUATION_IX));
        assert_eq!(&ixs[2].1[8..], &200_000_000u64.to_le_bytes());

        req.stage = LifecycleStage::PostGraduation;
        let post = f.build(&req, Hash::default()).unwrap();
        assert_eq!(instructions(&post[0])[2].0, f.post_graduation_program);
    }

    #[test]
    fn test_tip_is_last_instruction() {
        let tip_account = Pubkey::new_unique();
        let f = factory(Some((tip_account, 10_000)));
        let msgs = f.build(&request(AutomationKind::LiquidityTopUp), Hash::default()).unwrap();
        let ixs = instructions(msgs.last().unwrap());
        let (program, data) = ixs.last().unwrap();
        assert_eq!(*program, system_program::id());
        assert_eq!(&data[4..12], &10_000u64.to_le_bytes());
        assert!(msgs[0].static_account_keys().contains(&tip_account));
    }

    #[test]
    fn test_harvest_requires_valid_destination() {
        let f = factory(None);
        let mut req = request(AutomationKind::FeeHarvest);
        assert!(matches!(
            f.build(&req, Hash::default()),
            Err(OrchestrationError::InvalidDestination(_))
        ));
        req.destination = Some("not-a-key".into());
        assert!(matches!(
            f.build(&req, Hash::default()),
            Err(OrchestrationError::InvalidDestination(_))
        ));
        req.destination = Some(Pubkey::new_unique().to_string());
        assert!(f.build(&req, Hash::default()).is_ok());
    }

    #[test]
    fn test_burn_uses_token_program() {
        let f = factory(None);
        let msgs = f.build(&request(AutomationKind::TokenBurn), Hash::default()).unwrap();
        assert_eq!(instructions(&msgs[0])[2].0, spl_token::id());
    }
}
