// dumpcheck/src/config/operation.rs
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Which client executable an `OperationConfig` is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Dump,
    Restore,
}

impl ToolKind {
    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Dump => "dump",
            ToolKind::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DatabaseSelection {
    Single(String),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Encryption {
    pub enabled: bool,
    pub key_file_path: Option<PathBuf>,
}

/// Options for one dump or restore invocation.
///
/// Built once per role (dump, primary restore, secondary restore) and then
/// derived per step through the consuming `with_*` setters. Nothing here
/// touches the filesystem or the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationConfig {
    kind: ToolKind,
    endpoint: String,
    base_directory: PathBuf,
    /// Per-database subdirectory below `base_directory`; only valid with a single database.
    database_subdir: Option<String>,
    selection: DatabaseSelection,
    create_database: bool,
    include_system: bool,
    encryption: Encryption,
    compress_output: bool,
    auth: Option<Credentials>,
    thread_count: Option<u32>,
    collection: Option<String>,
    continuation_enabled: bool,
    fault_injection: bool,
}

impl OperationConfig {
    pub fn new(kind: ToolKind, endpoint: impl Into<String>, base_directory: impl Into<PathBuf>) -> Self {
        OperationConfig {
            kind,
            endpoint: endpoint.into(),
            base_directory: base_directory.into(),
            database_subdir: None,
            selection: DatabaseSelection::Single("_system".to_string()),
            create_database: kind == ToolKind::Restore,
            include_system: true,
            encryption: Encryption::default(),
            compress_output: false,
            auth: None,
            thread_count: None,
            collection: None,
            continuation_enabled: false,
            fault_injection: false,
        }
    }

    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn selection(&self) -> &DatabaseSelection {
        &self.selection
    }

    pub fn encryption(&self) -> &Encryption {
        &self.encryption
    }

    pub fn compress_output(&self) -> bool {
        self.compress_output
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn thread_count(&self) -> Option<u32> {
        self.thread_count
    }

    pub fn continuation_enabled(&self) -> bool {
        self.continuation_enabled
    }

    pub fn fault_injection(&self) -> bool {
        self.fault_injection
    }

    pub fn database_subdir(&self) -> Option<&str> {
        self.database_subdir.as_deref()
    }

    /// Directory the tool writes to (dump) or reads from (restore).
    pub fn directory(&self) -> PathBuf {
        match &self.database_subdir {
            Some(sub) => self.base_directory.join(sub),
            None => self.base_directory.clone(),
        }
    }

    /// Rebinds the configuration to another server, e.g. after a restart.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Selects every database. Clears a single-database selection and any
    /// per-database directory override.
    pub fn set_all_databases(mut self) -> Self {
        self.selection = DatabaseSelection::All;
        self.database_subdir = None;
        self
    }

    /// Selects a single database. Clears an all-databases selection.
    pub fn set_database(mut self, name: impl Into<String>) -> Self {
        self.selection = DatabaseSelection::Single(name.into());
        self
    }

    /// Selects a single database and points the directory at its own
    /// subdirectory, for topologies where every database is dumped apart.
    pub fn for_database_directory(self, name: &str) -> Self {
        let mut cfg = self.set_database(name);
        cfg.database_subdir = Some(name.to_string());
        cfg
    }

    pub fn with_create_database(mut self, create: bool) -> Self {
        self.create_database = create;
        self
    }

    pub fn with_include_system(mut self, include: bool) -> Self {
        self.include_system = include;
        self
    }

    pub fn with_auth(mut self, auth: Option<Credentials>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_threads(mut self, threads: Option<u32>) -> Self {
        self.thread_count = threads;
        self
    }

    /// Enables encryption with the given key file. On restore this drops a
    /// previous compression request, the tools never combine the two.
    pub fn with_encryption(mut self, key_file_path: impl Into<PathBuf>) -> Self {
        self.encryption = Encryption {
            enabled: true,
            key_file_path: Some(key_file_path.into()),
        };
        if self.kind == ToolKind::Restore {
            self.compress_output = false;
        }
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_output = compress && !(self.kind == ToolKind::Restore && self.encryption.enabled);
        self
    }

    pub fn restrict_to_collection(mut self, collection: Option<&str>) -> Self {
        self.collection = collection.map(str::to_string);
        self
    }

    pub fn with_continuation(mut self, enabled: bool) -> Self {
        self.continuation_enabled = enabled;
        self
    }

    pub fn with_fault_injection(mut self, enabled: bool) -> Self {
        self.fault_injection = enabled;
        self
    }

    /// Renders the command line flags understood by the dump/restore tools.
    pub fn to_argv(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |key: &str, value: String| {
            args.push(format!("--{}", key));
            args.push(value);
        };

        push("server.endpoint", self.endpoint.clone());
        if let Some(auth) = &self.auth {
            push("server.username", auth.username.clone());
            push("server.password", auth.password.clone());
        }
        match &self.selection {
            DatabaseSelection::All => push("all-databases", "true".into()),
            DatabaseSelection::Single(name) => push("server.database", name.clone()),
        }
        push("include-system-collections", self.include_system.to_string());

        let dir = path_arg(&self.directory());
        match self.kind {
            ToolKind::Dump => {
                push("output-directory", dir);
                push("overwrite", "true".into());
                push("compress-output", self.compress_output.to_string());
            }
            ToolKind::Restore => {
                push("input-directory", dir);
                push("create-database", self.create_database.to_string());
                if self.continuation_enabled {
                    push("continue", "true".into());
                }
                if self.fault_injection {
                    push("fail-after-update-continue-file", "true".into());
                }
            }
        }
        if let Some(key_file) = self.encryption.key_file_path.as_ref().filter(|_| self.encryption.enabled) {
            push("encryption.keyfile", path_arg(key_file));
        }
        if let Some(threads) = self.thread_count {
            push("threads", threads.to_string());
        }
        if let Some(collection) = &self.collection {
            push("collection", collection.clone());
        }
        args
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
