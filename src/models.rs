use crate::error::Error;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Name under which the base-currency sentinel token is stored.
pub const BASE_CURRENCY_TOKEN_NAME: &str = "bch";

pub const BASE_CURRENCY_ADDRESS_PREFIX: &str = "bitcoincash:";
pub const TOKEN_OVERLAY_ADDRESS_PREFIX: &str = "simpleledger:";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TokenIdentity {
    BaseCurrency,
    Overlay(String),
}

impl TokenIdentity {
    pub fn is_base_currency(&self) -> bool {
        matches!(self, TokenIdentity::BaseCurrency)
    }

    /// Value stored in `tokens.tokenid`.
    pub fn tokenid(&self) -> &str {
        match self {
            TokenIdentity::BaseCurrency => "",
            TokenIdentity::Overlay(id) => id.as_str(),
        }
    }
}

impl TryFrom<&str> for TokenIdentity {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case(BASE_CURRENCY_TOKEN_NAME) {
            return Ok(TokenIdentity::BaseCurrency);
        }
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(TokenIdentity::Overlay(s.to_ascii_lowercase()))
        } else {
            Err(Error::InvalidTokenIdentity(s.to_owned()))
        }
    }
}

impl fmt::Display for TokenIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenIdentity::BaseCurrency => write!(f, "{}", BASE_CURRENCY_TOKEN_NAME),
            TokenIdentity::Overlay(id) => write!(f, "{}", id),
        }
    }
}

/// Overlay token kinds, numbered as on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenType {
    Fungible,
    Nft,
    NftGroup,
}

impl TokenType {
    pub fn code(&self) -> i32 {
        match self {
            TokenType::Fungible => 1,
            TokenType::Nft => 65,
            TokenType::NftGroup => 129,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(TokenType::Fungible),
            65 => Some(TokenType::Nft),
            129 => Some(TokenType::NftGroup),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Incoming,
    Outgoing,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Incoming => "incoming",
            RecordType::Outgoing => "outgoing",
        }
    }
}

impl TryFrom<&str> for RecordType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "incoming" => Ok(RecordType::Incoming),
            "outgoing" => Ok(RecordType::Outgoing),
            other => Err(Error::InvalidChainData(format!("record type {}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalletType {
    BaseCurrency,
    TokenOverlay,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletType::BaseCurrency => "bch",
            WalletType::TokenOverlay => "slp",
        }
    }

    pub fn from_db(s: &str) -> Self {
        if s.eq_ignore_ascii_case("slp") {
            WalletType::TokenOverlay
        } else {
            WalletType::BaseCurrency
        }
    }
}

/// A reference to one output of a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: String,
    pub index: i32,
}

impl Outpoint {
    pub fn new(txid: impl Into<String>, index: i32) -> Self {
        Outpoint {
            txid: txid.into(),
            index,
        }
    }
}

/// One side of a wallet history entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    pub address: String,
    pub amount: BigDecimal,
}

impl Counterparty {
    pub fn new(address: impl Into<String>, amount: BigDecimal) -> Self {
        Counterparty {
            address: address.into(),
            amount,
        }
    }
}

/// Strips the cash-address prefix and lowercases, so both address forms land in the same room.
pub fn normalize_address(address: &str) -> String {
    let stripped = address
        .strip_prefix(BASE_CURRENCY_ADDRESS_PREFIX)
        .or_else(|| address.strip_prefix(TOKEN_OVERLAY_ADDRESS_PREFIX))
        .unwrap_or(address);
    stripped.to_ascii_lowercase()
}
