//! Worker modules: crawler, parser (shared with the extractor), and
//! analyzer.

pub mod analyzer;
pub mod crawler;
pub mod parser;

use std::sync::Arc;

use crate::models::{ModuleKind, QueryDef, ThreadEntry};
use crate::queries::CompiledQuery;
use crate::repository::{Db, QueryRepository, Result, StorageError};
use crate::supervisor::{WorkerEnv, WorkerModule};

/// Instantiate the module a thread row asks for. The extractor mirrors the
/// parser against its own lock and target tables.
pub fn build_module(entry: &ThreadEntry, env: Arc<WorkerEnv>) -> Result<Box<dyn WorkerModule>> {
    Ok(match entry.module {
        ModuleKind::Crawler => Box::new(crawler::CrawlerModule::new(env)),
        ModuleKind::Parser => Box::new(parser::ParserModule::new(env, ModuleKind::Parser)),
        ModuleKind::Extractor => Box::new(parser::ParserModule::new(env, ModuleKind::Extractor)),
        ModuleKind::Analyzer => Box::new(analyzer::AnalyzerModule::new(env)),
    })
}

/// Load and compile the stored queries named by a configuration.
///
/// A missing id is an error (the configuration references something the
/// operator deleted); a query that fails to compile is skipped with a
/// warning by the compile step.
pub fn load_queries(
    db: &Arc<Db>,
    website: i64,
    ids: &[i64],
) -> Result<Vec<CompiledQuery>> {
    let repo = QueryRepository::new(db.clone());
    let mut defs: Vec<QueryDef> = Vec::with_capacity(ids.len());
    for &id in ids {
        let def = repo.get(id)?;
        if let Some(owner) = def.website {
            if owner != website {
                return Err(StorageError::Invalid(format!(
                    "query {id} belongs to another website"
                )));
            }
        }
        defs.push(def);
    }
    Ok(crate::queries::compile_all(&defs))
}

/// Load a single optional query.
pub fn load_query(db: &Arc<Db>, website: i64, id: Option<i64>) -> Result<Option<CompiledQuery>> {
    match id {
        Some(id) => Ok(load_queries(db, website, &[id])?.into_iter().next()),
        None => Ok(None),
    }
}
