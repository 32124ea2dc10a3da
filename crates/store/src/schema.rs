//! Idempotent schema bootstrap.
//!
//! Conversations own frames, frames own messages (cascade deletes).
//! Messages reference their authoring agent weakly: deleting the agent
//! nulls the reference.

pub(crate) const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        display_name TEXT,
        system_prompt TEXT,
        lm_url TEXT,
        summary_model TEXT
    )",
    "CREATE TABLE IF NOT EXISTS agents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        system_prompt TEXT NOT NULL DEFAULT '',
        voice_reference TEXT,
        avatar_uuid TEXT,
        model_name TEXT,
        excluded_tools TEXT NOT NULL DEFAULT '[]',
        think INTEGER NOT NULL DEFAULT 0,
        memory TEXT,
        trigger_phrase TEXT,
        UNIQUE(user_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        title TEXT NOT NULL DEFAULT 'New conversation',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS frames (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        summary TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        frame_id INTEGER NOT NULL REFERENCES frames(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        name TEXT,
        content TEXT NOT NULL,
        thinking TEXT,
        agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
        raw_input TEXT,
        raw_output TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_frame ON messages(frame_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_frames_conversation ON frames(conversation_id, created_at)",
    "CREATE TABLE IF NOT EXISTS skills (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        instructions TEXT NOT NULL DEFAULT '',
        UNIQUE(user_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS tool_servers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        transport TEXT NOT NULL,
        url TEXT,
        command TEXT,
        args TEXT NOT NULL DEFAULT '[]',
        env TEXT NOT NULL DEFAULT '{}',
        enabled INTEGER NOT NULL DEFAULT 1,
        location TEXT
    )",
];
