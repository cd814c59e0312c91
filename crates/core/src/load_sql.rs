use std::fmt;

pub const DEFAULT_TABLE_NAME: &str = "dataset";
pub const DEFAULT_PREVIEW_LIMIT: u32 = 10;
pub const DEFAULT_EXTENSIONS: [&str; 2] = ["parquet", "httpfs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    table_name: String,
    preview_limit: u32,
    extensions: Vec<String>,
    install_extensions: bool,
}

impl Default for LoadPlan {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            extensions: DEFAULT_EXTENSIONS
                .iter()
                .map(|extension| (*extension).to_string())
                .collect(),
            install_extensions: false,
        }
    }
}

impl LoadPlan {
    #[must_use]
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_preview_limit(mut self, preview_limit: u32) -> Self {
        self.preview_limit = preview_limit;
        self
    }

    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_install_extensions(mut self, install_extensions: bool) -> Self {
        self.install_extensions = install_extensions;
        self
    }

    #[must_use]
    pub fn staging_table(&self, load: impl fmt::Display) -> String {
        format!("{}__load_{load}", self.table_name)
    }

    #[must_use]
    pub fn load_statement(&self, source: &str, staging: &str) -> String {
        let mut sql = String::new();
        for extension in &self.extensions {
            if self.install_extensions {
                sql.push_str(&format!("INSTALL {extension};"));
            }
            sql.push_str(&format!("LOAD {extension};"));
        }
        sql.push_str(&format!(
            "DROP TABLE IF EXISTS {staging};CREATE TABLE {staging} AS SELECT * FROM '{source}';",
            source = quote_literal(source),
        ));
        sql
    }

    #[must_use]
    pub fn commit_statement(&self, staging: &str) -> String {
        format!(
            "BEGIN TRANSACTION;DROP TABLE IF EXISTS {table};\
             ALTER TABLE {staging} RENAME TO {table};COMMIT;",
            table = self.table_name,
        )
    }

    #[must_use]
    pub fn discard_statement(&self, staging: &str) -> String {
        format!("DROP TABLE IF EXISTS {staging};")
    }

    #[must_use]
    pub fn default_query(&self) -> String {
        format!(
            "SELECT * FROM {} LIMIT {}",
            self.table_name, self.preview_limit
        )
    }
}

fn quote_literal(source: &str) -> String {
    source.replace('\'', "''")
}

#[must_use]
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
