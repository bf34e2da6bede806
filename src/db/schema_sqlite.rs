// SQLite schema definitions
// Mirrors schema.rs with timestamps stored as RFC 3339 text.

diesel::table! {
    guilds (guild_id) {
        guild_id -> Text,
        owner_id -> Text,
        ticket_counter -> BigInt,
        allow_users_to_close -> Bool,
        archive_on_close -> Bool,
        auto_close_enabled -> Bool,
        auto_close_after_hours -> Integer,
        ticket_category_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    tickets (id) {
        id -> BigInt,
        guild_id -> Text,
        number -> BigInt,
        channel_id -> Text,
        opener_id -> Text,
        claimed_by_id -> Nullable<Text>,
        subject -> Nullable<Text>,
        panel_id -> Nullable<Text>,
        status -> Text,
        close_request_id -> Nullable<Text>,
        close_reason -> Nullable<Text>,
        closed_by_id -> Nullable<Text>,
        exclude_from_autoclose -> Bool,
        metadata -> Nullable<Text>,
        created_at -> Text,
        closed_at -> Nullable<Text>,
        last_activity_at -> Text,
    }
}

diesel::table! {
    lifecycle_events (id) {
        id -> BigInt,
        ticket_id -> BigInt,
        action -> Text,
        performed_by_id -> Text,
        metadata -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    ticket_participants (id) {
        id -> BigInt,
        ticket_id -> BigInt,
        user_id -> Text,
        added_by_id -> Text,
        added_at -> Text,
    }
}

diesel::table! {
    ticket_feedback (id) {
        id -> BigInt,
        ticket_id -> BigInt,
        rating -> Integer,
        comment -> Nullable<Text>,
        submitted_by_id -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    guild_roles (id) {
        id -> BigInt,
        guild_id -> Text,
        name -> Text,
        permissions -> BigInt,
        is_default -> Bool,
        discord_role_id -> Nullable<Text>,
        position -> Integer,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    role_members (id) {
        id -> BigInt,
        guild_role_id -> BigInt,
        discord_id -> Text,
        assigned_at -> Text,
        assigned_by_id -> Nullable<Text>,
    }
}

diesel::table! {
    transcripts (id) {
        id -> BigInt,
        ticket_id -> BigInt,
        created_at -> Text,
    }
}

diesel::table! {
    ticket_messages (id) {
        id -> BigInt,
        transcript_id -> BigInt,
        message_id -> Text,
        author_id -> Text,
        content -> Text,
        embeds -> Nullable<Text>,
        attachments -> Nullable<Text>,
        message_type -> Text,
        reference_id -> Nullable<Text>,
        created_at -> Text,
        edited_at -> Nullable<Text>,
        deleted_at -> Nullable<Text>,
    }
}

diesel::joinable!(lifecycle_events -> tickets (ticket_id));
diesel::joinable!(ticket_participants -> tickets (ticket_id));
diesel::joinable!(ticket_feedback -> tickets (ticket_id));
diesel::joinable!(role_members -> guild_roles (guild_role_id));
diesel::joinable!(transcripts -> tickets (ticket_id));
diesel::joinable!(ticket_messages -> transcripts (transcript_id));

diesel::allow_tables_to_appear_in_same_query!(
    guilds,
    tickets,
    lifecycle_events,
    ticket_participants,
    ticket_feedback,
    guild_roles,
    role_members,
    transcripts,
    ticket_messages,
);
