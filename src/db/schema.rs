use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            email_address TEXT NOT NULL,
            credential BLOB,
            cursor TEXT,
            last_synced_at TEXT,
            UNIQUE (tenant_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS threads (
            id INTEGER PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            provider_thread_id TEXT NOT NULL,
            subject TEXT,
            last_message_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'archived')),
            UNIQUE (tenant_id, provider_thread_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            thread_id INTEGER NOT NULL REFERENCES threads(id),
            provider_message_id TEXT NOT NULL,
            from_address TEXT,
            to_addresses TEXT,
            sent_at TEXT NOT NULL,
            snippet TEXT,
            body_text TEXT,
            direction TEXT NOT NULL CHECK(direction IN ('inbound', 'outbound')),
            analysis TEXT,
            UNIQUE (tenant_id, provider_message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_accounts_last_synced_at ON accounts(last_synced_at);
        CREATE INDEX IF NOT EXISTS idx_threads_tenant ON threads(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_messages_tenant ON messages(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id);
        CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages(sent_at);
        "#,
    )
}
