//! Parallel validation over a rayon worker pool.
//!
//! Rules of a file run in parallel, and condition matching within a rule
//! runs over object chunks. Every merge step is order-preserving
//! (chunk-order concatenation, rule order fixed up front), so a parallel
//! run produces the same report as a sequential one.

use std::sync::Arc;

use rayon::prelude::*;
use shared_types::{BuildingModel, ComplianceReport, McpFile, McpRule, ValidationResult};
use tracing::info;

use crate::actions::ActionExecutor;
use crate::cache::ReportCache;
use crate::conditions::ConditionMatcher;
use crate::engine::{
    assemble_compliance_report, assemble_file_report, sorted_rule_indices, CancellationToken,
    ValidationEngine,
};
use crate::error::EngineError;
use crate::spatial::SpatialAnalyzer;

pub struct ParallelEngine<'a> {
    engine: &'a ValidationEngine,
    pool: Option<rayon::ThreadPool>,
    chunk_size: usize,
}

impl<'a> ParallelEngine<'a> {
    /// Wrap an engine with a worker pool per its config. A `worker_count`
    /// of 0 uses the process-global rayon pool.
    pub fn new(engine: &'a ValidationEngine) -> Result<Self, EngineError> {
        let config = engine.config();
        let pool = if config.worker_count == 0 {
            None
        } else {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.worker_count)
                    .build()
                    .map_err(|e| EngineError::WorkerPool(e.to_string()))?,
            )
        };
        Ok(Self {
            engine,
            pool,
            chunk_size: config.chunk_size.max(1),
        })
    }

    pub fn validate(
        &self,
        model: &BuildingModel,
        mcp_ids: &[&str],
        token: &CancellationToken,
    ) -> Result<Arc<ComplianceReport>, EngineError> {
        let files = self.engine.resolve_files(mcp_ids)?;
        match &self.pool {
            Some(pool) => pool.install(|| self.run(model, &files, token)),
            None => self.run(model, &files, token),
        }
    }

    fn run(
        &self,
        model: &BuildingModel,
        files: &[Arc<McpFile>],
        token: &CancellationToken,
    ) -> Result<Arc<ComplianceReport>, EngineError> {
        let file_refs: Vec<&McpFile> = files.iter().map(Arc::as_ref).collect();
        let key = ReportCache::key(model, &file_refs);
        if let Some(hit) = self.engine.cache().get(&key) {
            self.engine.metrics().increment("cache_hits", 1);
            return Ok(hit);
        }
        self.engine.metrics().increment("cache_misses", 1);

        let analyzer = SpatialAnalyzer::new(model);
        let matcher = ConditionMatcher::new(model, &analyzer);
        let executor = ActionExecutor::new(model, &analyzer);

        let mut file_reports = Vec::with_capacity(files.len());
        for file in files {
            // Execution order is fixed before fan-out; rayon's ordered
            // collect keeps results aligned with it.
            let indices = sorted_rule_indices(&file.rules);
            let results: Result<Vec<ValidationResult>, EngineError> = indices
                .par_iter()
                .map(|index| {
                    if token.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    let rule = &file.rules[*index];
                    let matched = self.match_chunked(&matcher, rule, model.objects.len());
                    Ok(executor.execute(rule, &matched))
                })
                .collect();
            file_reports.push(assemble_file_report(file, results?));
        }

        let report = Arc::new(assemble_compliance_report(model, file_reports));
        self.engine.metrics().increment("validations_run", 1);
        self.engine
            .metrics()
            .increment("violations_found", report.total_violations as u64);
        info!(
            building_id = %model.building_id,
            score = report.overall_compliance_score,
            workers = self.pool.as_ref().map(|p| p.current_num_threads()).unwrap_or(0),
            "parallel validation finished"
        );

        self.engine.cache().put(&model.building_id, &key, report.clone());
        Ok(report)
    }

    /// Chunked condition matching. Each object matches independently of the
    /// others, so concatenating chunk results in chunk order equals a full
    /// sequential pass.
    fn match_chunked(
        &self,
        matcher: &ConditionMatcher<'_>,
        rule: &McpRule,
        object_count: usize,
    ) -> Vec<usize> {
        if rule.conditions.is_empty() {
            return Vec::new();
        }
        let all: Vec<usize> = (0..object_count).collect();
        all.par_chunks(self.chunk_size)
            .map(|chunk| matcher.narrow(&rule.conditions, chunk.to_vec()))
            .reduce(Vec::new, |mut acc, mut chunk| {
                acc.append(&mut chunk);
                acc
            })
    }
}
