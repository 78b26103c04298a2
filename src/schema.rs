// Backend-agnostic table definitions; all column types are shared by the
// SQLite and PostgreSQL migrations.

diesel::table! {
    users (id) {
        id -> BigInt,
        username -> Text,
        user_group -> Text,
        quota -> BigInt,
        used_quota -> BigInt,
        request_count -> BigInt,
        status -> Integer,
    }
}

diesel::table! {
    tokens (id) {
        id -> BigInt,
        user_id -> BigInt,
        token_key -> Text,
        name -> Text,
        status -> Integer,
        remaining_quota -> BigInt,
        unlimited_quota -> Bool,
        expired_time -> BigInt,
        created_time -> BigInt,
        accessed_time -> BigInt,
    }
}

diesel::table! {
    channels (id) {
        id -> BigInt,
        channel_type -> Integer,
        channel_key -> Text,
        name -> Text,
        status -> Integer,
        weight -> BigInt,
        priority -> BigInt,
        async_num -> Integer,
        base_url -> Text,
        full_url -> Text,
        other -> Text,
        models -> Text,
        channel_group -> Text,
        model_mapping -> Text,
        used_quota -> BigInt,
        created_time -> BigInt,
        test_time -> BigInt,
        response_time -> Integer,
    }
}

diesel::table! {
    abilities (ability_group, model, channel_id) {
        ability_group -> Text,
        model -> Text,
        channel_id -> BigInt,
        enabled -> Bool,
        priority -> BigInt,
        weight -> BigInt,
    }
}

diesel::table! {
    consume_logs (id) {
        id -> BigInt,
        user_id -> BigInt,
        channel_id -> BigInt,
        token_id -> BigInt,
        model_name -> Text,
        token_name -> Text,
        prompt_tokens -> BigInt,
        completion_tokens -> BigInt,
        quota -> BigInt,
        content -> Text,
        created_at -> BigInt,
    }
}

diesel::table! {
    options (option_key) {
        option_key -> Text,
        option_value -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(users, tokens, channels, abilities, consume_logs, options);
