table! {
    block_heights (id) {
        id -> BigInt,
        number -> Integer,
        processed -> Bool,
        transactions_count -> Integer,
        requires_full_scan -> Bool,
        genesis -> Array<Text>,
        problematic -> Array<Text>,
        created_datetime -> Timestamptz,
        updated_datetime -> Nullable<Timestamptz>,
    }
}

table! {
    tokens (id) {
        id -> BigInt,
        tokenid -> Varchar,
        name -> Varchar,
        token_ticker -> Varchar,
        token_type -> Nullable<Integer>,
        decimals -> Nullable<Integer>,
        nft_token_group_id -> Nullable<BigInt>,
        original_image_url -> Nullable<Varchar>,
        thumbnail_image_url -> Nullable<Varchar>,
        metadata -> Nullable<Jsonb>,
        date_updated -> Nullable<Timestamptz>,
    }
}

table! {
    wallets (id) {
        id -> BigInt,
        wallet_hash -> Varchar,
        wallet_type -> Varchar,
        version -> Integer,
    }
}

table! {
    addresses (id) {
        id -> BigInt,
        address -> Varchar,
        wallet_id -> Nullable<BigInt>,
        address_path -> Nullable<Varchar>,
    }
}

table! {
    recipients (id) {
        id -> BigInt,
        web_url -> Varchar,
        telegram_id -> Varchar,
        slack_channel_id -> Varchar,
        valid -> Bool,
    }
}

table! {
    subscriptions (id) {
        id -> BigInt,
        address_id -> BigInt,
        recipient_id -> Nullable<BigInt>,
        websocket -> Bool,
        date_created -> Timestamptz,
    }
}

table! {
    transactions (id) {
        id -> BigInt,
        txid -> Varchar,
        address_id -> BigInt,
        token_id -> BigInt,
        amount -> Numeric,
        output_index -> Integer,
        source -> Varchar,
        blockheight_id -> Nullable<BigInt>,
        spent -> Bool,
        spending_txid -> Nullable<Varchar>,
        acknowledged -> Bool,
        queued -> Bool,
        date_created -> Timestamptz,
    }
}

table! {
    wallet_histories (id) {
        id -> BigInt,
        wallet_id -> BigInt,
        txid -> Varchar,
        record_type -> Varchar,
        amount -> Numeric,
        token_id -> BigInt,
        tx_fee -> Nullable<Numeric>,
        senders -> Jsonb,
        recipients -> Jsonb,
        date_created -> Timestamptz,
    }
}

table! {
    wallet_nft_tokens (id) {
        id -> BigInt,
        wallet_id -> BigInt,
        token_id -> BigInt,
        acquisition_txid -> Varchar,
        date_acquired -> Timestamptz,
        dispensation_txid -> Nullable<Varchar>,
        date_dispensed -> Nullable<Timestamptz>,
    }
}

joinable!(addresses -> wallets (wallet_id));
joinable!(subscriptions -> addresses (address_id));
joinable!(subscriptions -> recipients (recipient_id));
joinable!(transactions -> addresses (address_id));
joinable!(transactions -> tokens (token_id));
joinable!(transactions -> block_heights (blockheight_id));
joinable!(wallet_histories -> wallets (wallet_id));
joinable!(wallet_nft_tokens -> wallets (wallet_id));

allow_tables_to_appear_in_same_query!(
    addresses,
    block_heights,
    recipients,
    subscriptions,
    tokens,
    transactions,
    wallet_histories,
    wallet_nft_tokens,
    wallets,
);
