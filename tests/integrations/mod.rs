// Governor integration suites

mod cache_behaviour;
mod execution_limits;
mod index_advice;
mod recorder_stats;
