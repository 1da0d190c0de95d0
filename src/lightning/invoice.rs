use std::str::FromStr as _;

use bitcoin::hashes::Hash as _;
use lightning_invoice::{Bolt11Invoice, Currency};

use crate::config::Network;
use crate::error::SwapProtocolError;

/// The parts of a BOLT11 invoice a swap is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceTerms {
    pub payment_hash: [u8; 32],
    pub amount_sat: u64,
}

/// Parses `invoice` and checks it belongs to `network`, carries a whole-sat
/// amount and has not expired.
pub fn decode_bolt11(invoice: &str, network: Network) -> Result<InvoiceTerms, SwapProtocolError> {
    let invoice = Bolt11Invoice::from_str(invoice.trim())
        .map_err(|e| SwapProtocolError::InvalidInvoice(format!("parse BOLT11 invoice: {e:?}")))?;

    let expected = currency_for(network);
    if invoice.currency() != expected {
        return Err(SwapProtocolError::InvalidInvoice(format!(
            "invoice currency {:?} does not match network {expected:?}",
            invoice.currency()
        )));
    }
    if invoice.is_expired() {
        return Err(SwapProtocolError::InvalidInvoice("invoice expired".into()));
    }

    let amount_msat = invoice
        .amount_milli_satoshis()
        .ok_or_else(|| SwapProtocolError::InvalidInvoice("invoice has no amount".into()))?;
    if amount_msat % 1000 != 0 {
        return Err(SwapProtocolError::InvalidInvoice(format!(
            "amount {amount_msat} msat is not a whole number of sats"
        )));
    }

    Ok(InvoiceTerms {
        payment_hash: invoice.payment_hash().to_byte_array(),
        amount_sat: amount_msat / 1000,
    })
}

pub fn currency_for(network: Network) -> Currency {
    match network {
        Network::Mainnet => Currency::Bitcoin,
        Network::Testnet => Currency::BitcoinTestnet,
        Network::Regtest => Currency::Regtest,
    }
}
