// Diesel table definitions for the authoritative schema (spec §6).

diesel::table! {
    use diesel::sql_types::*;

    entities (id) {
        id -> Text,
        entity_type -> Text,
        canonical_name -> Text,
        aliases -> Jsonb,
        external_ids -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    facts (id) {
        id -> Uuid,
        entity_id -> Text,
        name -> Text,
        value -> Jsonb,
        dtype -> Text,
        confidence -> Nullable<Float4>,
        sources -> Jsonb,
        notes -> Nullable<Text>,
        observed_at -> Timestamptz,
        valid_from -> Timestamptz,
        valid_to -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    user_memory (id) {
        id -> Uuid,
        username -> Text,
        text -> Text,
        tags -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(facts -> entities (entity_id));

diesel::allow_tables_to_appear_in_same_query!(entities, facts, user_memory,);
