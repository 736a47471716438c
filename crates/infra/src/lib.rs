//! Infrastructure layer: the job store, collaborator ports, and the
//! dispatch services built on top of them.
//!
//! Everything that mutates queue state goes through [`store::JobStore`],
//! whose transition methods are conditional updates guarded by the expected
//! prior status. That predicate discipline is the only mutual-exclusion
//! mechanism in the system — there is no in-process lock shared between
//! request handlers, replicas, or the sweeper.

pub mod audit;
pub mod content;
pub mod directory;
pub mod dispatch;
pub mod store;

#[cfg(test)]
mod integration_tests;
