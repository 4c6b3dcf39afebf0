//! Token listing filters behind `GET /tokens`.

use bigdecimal::{BigDecimal, Zero};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use url::form_urlencoded;

use crate::db::{RecordRepoOperations, Token};
use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenQuery {
    pub wallet_hash: Option<String>,
    pub has_balance: Option<bool>,
    pub exclude_token_ids: HashSet<String>,
}

impl TokenQuery {
    /// Never fails: unknown or malformed parameters are dropped.
    pub fn parse(raw_query: &str) -> Self {
        let mut query = TokenQuery::default();
        for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
            match key.as_ref() {
                "wallet_hash" if !value.trim().is_empty() => {
                    query.wallet_hash = Some(value.trim().to_owned())
                }
                "has_balance" => {
                    query.has_balance = match value.trim().to_ascii_lowercase().as_str() {
                        "true" => Some(true),
                        "false" => Some(false),
                        _ => None,
                    }
                }
                "exclude_token_ids" => query.exclude_token_ids.extend(
                    value
                        .split(',')
                        .map(|id| id.trim().to_ascii_lowercase())
                        .filter(|id| !id.is_empty()),
                ),
                _ => {}
            }
        }
        query
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TokenView {
    pub id: i64,
    pub tokenid: String,
    pub name: String,
    pub ticker: String,
    pub token_type: Option<i32>,
    pub decimals: Option<i32>,
    pub image_url: Option<String>,
}

impl From<Token> for TokenView {
    fn from(token: Token) -> Self {
        TokenView {
            id: token.id,
            ticker: token.ticker_or_name().to_owned(),
            tokenid: token.tokenid,
            name: token.name,
            token_type: token.token_type,
            decimals: token.decimals,
            image_url: token.thumbnail_image_url.or(token.original_image_url),
        }
    }
}

pub fn filter_tokens<O: RecordRepoOperations + ?Sized>(
    ops: &mut O,
    query: &TokenQuery,
) -> Result<Vec<Token>> {
    let mut tokens = ops.tokens()?;

    if let Some(wallet_hash) = &query.wallet_hash {
        let wallet = match ops.find_wallet_by_hash(wallet_hash)? {
            Some(wallet) => wallet,
            None => return Ok(vec![]),
        };
        let address_ids: Vec<i64> = ops
            .wallet_addresses(wallet.id)?
            .into_iter()
            .map(|a| a.id)
            .collect();
        let transactions = ops.transactions_for_addresses(&address_ids)?;

        let mut balances: HashMap<i64, BigDecimal> = HashMap::new();
        for transaction in &transactions {
            let balance = balances.entry(transaction.token_id).or_insert_with(BigDecimal::zero);
            if query.has_balance.is_some() && !transaction.spent {
                *balance += &transaction.amount;
            }
        }

        tokens.retain(|token| match (balances.get(&token.id), query.has_balance) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(balance), Some(true)) => *balance > BigDecimal::zero(),
            (Some(balance), Some(false)) => *balance <= BigDecimal::zero(),
        });
    }

    if !query.exclude_token_ids.is_empty() {
        tokens.retain(|token| {
            let identity = token.identity().to_string().to_ascii_lowercase();
            !query.exclude_token_ids.contains(&identity)
        });
    }

    Ok(tokens)
}
