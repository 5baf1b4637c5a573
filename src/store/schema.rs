//! SQL schema expected by row-oriented atom stores.
//!
//! The schema is owned by the external loader; these constants document the
//! columns the stores read.

/// Atom rows.
pub const ATOMS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS prompt_atoms (
    id                  TEXT PRIMARY KEY,
    version             INTEGER NOT NULL DEFAULT 1,
    content_hash        TEXT,
    content             TEXT NOT NULL,
    content_concise     TEXT,
    content_min         TEXT,
    token_count         INTEGER,
    concise_token_count INTEGER,
    min_token_count     INTEGER,
    category            TEXT NOT NULL,
    subcategory         TEXT,
    priority            INTEGER NOT NULL DEFAULT 0,
    is_mandatory        BOOLEAN NOT NULL DEFAULT FALSE,
    exclusion_group     TEXT,
    depends_on          TEXT[] NOT NULL DEFAULT '{}',
    conflicts_with      TEXT[] NOT NULL DEFAULT '{}',
    embedding           BYTEA
);
"#;

/// `(atom_id, dimension, tag)` associations.
pub const CONTEXT_TAGS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS atom_context_tags (
    atom_id   TEXT NOT NULL REFERENCES prompt_atoms(id) ON DELETE CASCADE,
    dimension TEXT NOT NULL,
    tag       TEXT NOT NULL,
    PRIMARY KEY (atom_id, dimension, tag)
);

CREATE INDEX IF NOT EXISTS idx_atom_context_tags_dimension
    ON atom_context_tags(dimension, tag);
"#;

/// Vector embeddings, keyed by atom and model.
pub const EMBEDDINGS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS atom_embeddings (
    atom_id      TEXT NOT NULL REFERENCES prompt_atoms(id) ON DELETE CASCADE,
    model        TEXT NOT NULL,
    dimensions   INTEGER NOT NULL,
    embedding    BYTEA NOT NULL,
    content_hash TEXT NOT NULL,
    PRIMARY KEY (atom_id, model)
);
"#;
