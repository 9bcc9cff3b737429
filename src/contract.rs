// src/contract.rs
//! Transition rules for cash and stock records.
//!
//! Everything here is a pure function of the [`LedgerTransaction`] it is
//! given. Every party runs the same checks on the same transaction and must
//! reach the same verdict, so nothing in this module may read clocks,
//! configuration or shared state.

use crate::error::ContractViolation;
use crate::record::AssetRecord;
use crate::transaction::{Command, LedgerTransaction};

pub const SUPPORTED_CURRENCY: &str = "USD";
pub const AMOUNT_CEILING: f64 = 500_000.0;
pub const MAX_TICKER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(ContractViolation),
}

impl Verdict {
    pub fn of(tx: &LedgerTransaction) -> Self {
        match verify(tx) {
            Ok(()) => Self::Valid,
            Err(violation) => Self::Invalid(violation),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Check `tx` against the rules of its single declared command.
pub fn verify(tx: &LedgerTransaction) -> Result<(), ContractViolation> {
    match single_command(tx)? {
        Command::IssueCash => verify_issue_cash(tx),
        Command::IssueStock => verify_issue_stock(tx),
        Command::TransferCash => {
            let (input, output) = single_pair(tx, "cash", AssetRecord::is_cash)?;
            verify_cash_move(input, output)
        }
        Command::TransferStock => {
            let (input, output) = single_pair(tx, "stock", AssetRecord::is_stock)?;
            verify_stock_move(input, output)
        }
        Command::SwapCashForStock => verify_swap(tx),
    }
}

fn require(condition: bool, message: &str) -> Result<(), ContractViolation> {
    if condition {
        Ok(())
    } else {
        Err(ContractViolation::Rule(message.to_string()))
    }
}

fn structural(message: impl Into<String>) -> ContractViolation {
    ContractViolation::Structural(message.into())
}

fn single_command(tx: &LedgerTransaction) -> Result<Command, ContractViolation> {
    match tx.commands.as_slice() {
        [command] => Ok(*command),
        [] => Err(structural("A transaction must declare exactly one command, found none")),
        many => Err(structural(format!(
            "A transaction must declare exactly one command, found {}",
            many.len()
        ))),
    }
}

fn verify_issue_cash(tx: &LedgerTransaction) -> Result<(), ContractViolation> {
    if !tx.inputs.is_empty() {
        return Err(structural("No inputs should be consumed when issuing Cash."));
    }
    let output = match tx.outputs.as_slice() {
        [output] if output.is_cash() => output,
        _ => return Err(structural("Issuing Cash must produce exactly one cash record")),
    };

    require(
        output.currency() == Some(SUPPORTED_CURRENCY),
        "The currency must be USD",
    )?;
    require(output.amount > 0.0, "The amount must be greater than 0")?;
    require(output.amount < AMOUNT_CEILING, "The amount must be less than 500,000")?;
    Ok(())
}

fn verify_issue_stock(tx: &LedgerTransaction) -> Result<(), ContractViolation> {
    if !tx.inputs.is_empty() {
        return Err(structural("No inputs should be consumed when issuing Stock."));
    }
    let output = match tx.outputs.as_slice() {
        [output] if output.is_stock() => output,
        _ => return Err(structural("Issuing Stock must produce exactly one stock record")),
    };

    let ticker = output.ticker().unwrap_or_default();
    require(!ticker.is_empty(), "The ticker must not be empty")?;
    require(
        ticker.chars().count() <= MAX_TICKER_LEN,
        "The ticker must be at most 4 letters",
    )?;
    require(output.amount > 0.0, "The amount must be greater than 0")?;
    require(output.amount < AMOUNT_CEILING, "The amount must be less than 500,000")?;
    Ok(())
}

/// Exactly one input and one output, both of the kind `is_kind` accepts.
fn single_pair<'a>(
    tx: &'a LedgerTransaction,
    label: &str,
    is_kind: fn(&AssetRecord) -> bool,
) -> Result<(&'a AssetRecord, &'a AssetRecord), ContractViolation> {
    match (tx.inputs.as_slice(), tx.outputs.as_slice()) {
        ([input], [output]) if is_kind(&input.state) && is_kind(output) => {
            Ok((&input.state, output))
        }
        _ => Err(structural(format!(
            "A {label} transfer must consume one {label} record and produce one {label} record"
        ))),
    }
}

fn verify_cash_move(input: &AssetRecord, output: &AssetRecord) -> Result<(), ContractViolation> {
    require(input.amount > 0.0, "The cash input amount must be greater than 0")?;
    require(
        input.amount < AMOUNT_CEILING,
        "The cash input amount must be less than 500,000",
    )?;
    require(
        input.amount == output.amount,
        "The cash input amount must match the output amount",
    )?;
    require(
        input.currency() == Some(SUPPORTED_CURRENCY),
        "The cash input currency must be USD",
    )?;
    require(
        input.currency() == output.currency(),
        "The cash input currency must match the output currency",
    )?;
    require(input.owner != output.owner, "The cash must change owners")?;
    Ok(())
}

fn verify_stock_move(input: &AssetRecord, output: &AssetRecord) -> Result<(), ContractViolation> {
    let ticker = input.ticker().unwrap_or_default();
    require(input.amount > 0.0, "The stock input amount must be greater than 0")?;
    require(
        input.amount < AMOUNT_CEILING,
        "The stock input amount must be less than 500,000",
    )?;
    require(
        input.amount == output.amount,
        "The stock input amount must match the output amount",
    )?;
    require(
        ticker.chars().count() <= MAX_TICKER_LEN,
        "The stock input ticker must be at most 4 letters",
    )?;
    require(
        input.ticker() == output.ticker(),
        "The stock input ticker must match the output ticker",
    )?;
    require(input.owner != output.owner, "The stock must change owners")?;
    Ok(())
}

fn verify_swap(tx: &LedgerTransaction) -> Result<(), ContractViolation> {
    let shape_error = || {
        structural(
            "A swap must consume one cash and one stock record and produce one of each",
        )
    };
    if tx.inputs.len() != 2 || tx.outputs.len() != 2 {
        return Err(shape_error());
    }
    let (cash_in, stock_in, cash_out, stock_out) = match (
        only(tx.cash_inputs()),
        only(tx.stock_inputs()),
        only(tx.cash_outputs()),
        only(tx.stock_outputs()),
    ) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return Err(shape_error()),
    };

    verify_cash_move(cash_in, cash_out)?;
    verify_stock_move(stock_in, stock_out)?;
    require(
        cash_out.owner == stock_in.owner,
        "The cash output owner must be the stock input owner",
    )?;
    require(
        stock_out.owner == cash_in.owner,
        "The stock output owner must be the cash input owner",
    )?;
    Ok(())
}

fn only<'a>(mut iter: impl Iterator<Item = &'a AssetRecord>) -> Option<&'a AssetRecord> {
    let first = iter.next()?;
    match iter.next() {
        Some(_) => None,
        None => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Party, PublicKey};
    use crate::record::{StateAndRef, StateRef};
    use crate::transaction::TxId;
    use proptest::prelude::*;

    fn alice() -> Party {
        Party::new("Alice", PublicKey([1; 32]))
    }

    fn bob() -> Party {
        Party::new("Bob", PublicKey([2; 32]))
    }

    fn input(state: AssetRecord, index: u32) -> StateAndRef {
        StateAndRef {
            state,
            reference: StateRef::new(TxId([0xaa; 32]), index),
        }
    }

    fn issue(output: AssetRecord, command: Command) -> LedgerTransaction {
        LedgerTransaction {
            inputs: vec![],
            outputs: vec![output],
            commands: vec![command],
        }
    }

    fn transfer(from: AssetRecord, to: AssetRecord, command: Command) -> LedgerTransaction {
        LedgerTransaction {
            inputs: vec![input(from, 0)],
            outputs: vec![to],
            commands: vec![command],
        }
    }

    fn swap(
        cash_in: AssetRecord,
        stock_in: AssetRecord,
        cash_out: AssetRecord,
        stock_out: AssetRecord,
    ) -> LedgerTransaction {
        LedgerTransaction {
            inputs: vec![input(cash_in, 0), input(stock_in, 1)],
            outputs: vec![cash_out, stock_out],
            commands: vec![Command::SwapCashForStock],
        }
    }

    fn rule(tx: &LedgerTransaction) -> String {
        match verify(tx) {
            Err(ContractViolation::Rule(reason)) => reason,
            other => panic!("expected a rule violation, got {other:?}"),
        }
    }

    #[test]
    fn issue_cash_bounds() {
        let ok = issue(AssetRecord::cash("USD", 1000.0, alice()), Command::IssueCash);
        assert!(verify(&ok).is_ok());

        let zero = issue(AssetRecord::cash("USD", 0.0, alice()), Command::IssueCash);
        assert_eq!(rule(&zero), "The amount must be greater than 0");

        let ceiling = issue(AssetRecord::cash("USD", 500_000.0, alice()), Command::IssueCash);
        assert_eq!(rule(&ceiling), "The amount must be less than 500,000");

        let euro = issue(AssetRecord::cash("EUR", 10.0, alice()), Command::IssueCash);
        assert_eq!(rule(&euro), "The currency must be USD");
    }

    #[test]
    fn issue_with_inputs_is_structural() {
        let mut tx = issue(AssetRecord::cash("USD", 10.0, alice()), Command::IssueCash);
        tx.inputs.push(input(AssetRecord::cash("USD", 10.0, bob()), 0));
        assert!(matches!(verify(&tx), Err(ContractViolation::Structural(_))));
    }

    #[test]
    fn issue_stock_ticker_length() {
        for ticker in ["I", "IBM", "GOOG"] {
            let tx = issue(AssetRecord::stock(ticker, 10.0, alice()), Command::IssueStock);
            assert!(verify(&tx).is_ok(), "{ticker} should be admissible");
        }
        let long = issue(AssetRecord::stock("GOOGL", 10.0, alice()), Command::IssueStock);
        assert_eq!(rule(&long), "The ticker must be at most 4 letters");
    }

    #[test]
    fn command_must_match_output_kind() {
        let tx = issue(AssetRecord::stock("IBM", 10.0, alice()), Command::IssueCash);
        assert!(matches!(verify(&tx), Err(ContractViolation::Structural(_))));
    }

    #[test]
    fn missing_or_ambiguous_command_is_structural() {
        let mut tx = issue(AssetRecord::cash("USD", 10.0, alice()), Command::IssueCash);
        tx.commands.clear();
        assert!(matches!(verify(&tx), Err(ContractViolation::Structural(_))));

        tx.commands = vec![Command::IssueCash, Command::IssueCash];
        assert!(matches!(verify(&tx), Err(ContractViolation::Structural(_))));
    }

    #[test]
    fn transfer_preserves_amount_and_code() {
        let from = AssetRecord::stock("IBM", 50.0, alice());
        let ok = transfer(from.clone(), from.reassigned(bob()), Command::TransferStock);
        assert!(verify(&ok).is_ok());

        let shrunk = transfer(from.clone(), AssetRecord::stock("IBM", 49.0, bob()), Command::TransferStock);
        assert_eq!(rule(&shrunk), "The stock input amount must match the output amount");

        let renamed = transfer(from, AssetRecord::stock("MSFT", 50.0, bob()), Command::TransferStock);
        assert_eq!(rule(&renamed), "The stock input ticker must match the output ticker");

        let cash = AssetRecord::cash("USD", 5.0, alice());
        let relabelled = transfer(cash, AssetRecord::cash("EUR", 5.0, bob()), Command::TransferCash);
        assert_eq!(rule(&relabelled), "The cash input currency must match the output currency");
    }

    #[test]
    fn transfer_must_change_owner() {
        let cash = AssetRecord::cash("USD", 5.0, alice());
        let tx = transfer(cash.clone(), cash, Command::TransferCash);
        assert_eq!(rule(&tx), "The cash must change owners");
    }

    #[test]
    fn transfer_rejects_foreign_currency_input() {
        let cash = AssetRecord::cash("GBP", 5.0, alice());
        let tx = transfer(cash.clone(), cash.reassigned(bob()), Command::TransferCash);
        assert_eq!(rule(&tx), "The cash input currency must be USD");
    }

    #[test]
    fn reciprocal_swap_is_valid() {
        let cash = AssetRecord::cash("USD", 100.0, alice());
        let stock = AssetRecord::stock("XYZ", 10.0, bob());
        let tx = swap(cash.clone(), stock.clone(), cash.reassigned(bob()), stock.reassigned(alice()));
        assert_eq!(Verdict::of(&tx), Verdict::Valid);
    }

    #[test]
    fn one_directional_swap_is_rejected() {
        let carol = Party::new("Carol", PublicKey([3; 32]));
        let cash = AssetRecord::cash("USD", 100.0, alice());
        let stock = AssetRecord::stock("XYZ", 10.0, bob());

        let tx = swap(cash.clone(), stock.clone(), cash.reassigned(bob()), stock.reassigned(carol.clone()));
        assert_eq!(rule(&tx), "The stock output owner must be the cash input owner");

        let tx = swap(cash.clone(), stock.clone(), cash.reassigned(carol), stock.reassigned(alice()));
        assert_eq!(rule(&tx), "The cash output owner must be the stock input owner");
    }

    #[test]
    fn swap_shape_is_structural() {
        let cash = AssetRecord::cash("USD", 100.0, alice());
        let tx = LedgerTransaction {
            inputs: vec![input(cash.clone(), 0), input(cash.clone(), 1)],
            outputs: vec![cash.reassigned(bob()), cash.reassigned(bob())],
            commands: vec![Command::SwapCashForStock],
        };
        assert!(matches!(verify(&tx), Err(ContractViolation::Structural(_))));
    }

    proptest! {
        #[test]
        fn cash_issuance_is_valid_exactly_inside_the_range(amount in -10.0f64..600_000.0) {
            let tx = issue(AssetRecord::cash("USD", amount, alice()), Command::IssueCash);
            prop_assert_eq!(verify(&tx).is_ok(), amount > 0.0 && amount < AMOUNT_CEILING);
        }

        #[test]
        fn ticker_longer_than_four_is_invalid(ticker in "[A-Z]{1,8}") {
            let tx = issue(AssetRecord::stock(ticker.clone(), 10.0, alice()), Command::IssueStock);
            prop_assert_eq!(verify(&tx).is_ok(), ticker.len() <= MAX_TICKER_LEN);
        }

        #[test]
        fn verdict_is_repeatable(amount in 0.0f64..1_000_000.0, change_owner in any::<bool>()) {
            let from = AssetRecord::cash("USD", amount, alice());
            let to = if change_owner { from.reassigned(bob()) } else { from.clone() };
            let tx = transfer(from, to, Command::TransferCash);
            let first = Verdict::of(&tx);
            for _ in 0..3 {
                prop_assert_eq!(Verdict::of(&tx), first.clone());
            }
        }
    }
}
