//! PyO3 bindings consumed by the Python web layer.
//!
//! One engine per process, configured once at startup. Structured values
//! cross the boundary as JSON strings or dicts.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use serde::Serialize;

use crate::analytics::SortKey;
use crate::config::{EngineConfig, SigningSecret};
use crate::error::VoteError;
use crate::init_logger;
use crate::pipeline::{CastVoteRequest, VoteEngine};
use crate::storage::models::{Actor, Category, CategoryId, Event, EventId, PaymentStatus, VoteId};

lazy_static! {
    static ref ENGINE: RwLock<Option<VoteEngine>> = RwLock::new(None);
}

fn to_py_err(e: VoteError) -> PyErr {
    match e {
        VoteError::NotFound { .. } => PyKeyError::new_err(e.to_string()),
        VoteError::Validation(_) | VoteError::InvalidTransition { .. } => PyValueError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

fn with_engine<T>(f: impl FnOnce(&VoteEngine) -> Result<T, VoteError>) -> PyResult<T> {
    let guard = ENGINE.read();
    let engine = guard
        .as_ref()
        .ok_or_else(|| PyRuntimeError::new_err("engine not configured; call configure_engine first"))?;
    f(engine).map_err(to_py_err)
}

fn to_json<T: Serialize>(value: &T) -> PyResult<String> {
    serde_json::to_string(value).map_err(|e| PyRuntimeError::new_err(e.to_string()))
}

fn parse<T: std::str::FromStr<Err = VoteError>>(s: &str) -> PyResult<T> {
    s.parse().map_err(to_py_err)
}

/// Build the process-wide engine.
///
/// Without an explicit secret, configuration is read from `PAGEANTRY_*`
/// environment variables.
#[pyfunction]
#[pyo3(signature = (signing_secret=None))]
fn configure_engine(signing_secret: Option<String>) -> PyResult<()> {
    init_logger();

    let config = match signing_secret {
        Some(secret) => EngineConfig::new(SigningSecret::new(secret)),
        None => EngineConfig::from_env().map_err(|e| PyValueError::new_err(format!("{:#}", e)))?,
    };
    let engine = VoteEngine::with_defaults(config).map_err(to_py_err)?;
    *ENGINE.write() = Some(engine);

    log::info!("ENGINE_CONFIGURED");
    Ok(())
}

/// Register an event from its JSON form. Returns the event id.
#[pyfunction]
fn register_event(event_json: String) -> PyResult<String> {
    let event: Event =
        serde_json::from_str(&event_json).map_err(|e| PyValueError::new_err(format!("invalid event: {}", e)))?;
    let id = event.id;
    with_engine(|engine| engine.ledger().register_event(event))?;
    Ok(id.to_string())
}

#[pyfunction]
fn register_category(event_id: String, name: String) -> PyResult<String> {
    let category = Category {
        id: CategoryId::new(),
        event_id: parse::<EventId>(&event_id)?,
        name,
    };
    let id = category.id;
    with_engine(|engine| engine.ledger().register_category(category))?;
    Ok(id.to_string())
}

#[pyfunction]
fn register_contestant(category_id: String, name: String) -> PyResult<String> {
    let category_id: CategoryId = parse(&category_id)?;
    let contestant = with_engine(|engine| {
        engine
            .ledger()
            .register_contestant(category_id, &name, engine.now())
    })?;
    Ok(contestant.id.to_string())
}

/// Score and record a vote.
///
/// # Arguments
/// * `request_json` - Serialized cast request (event, contestant, units,
///   voter email, remote address, headers, payment reference)
///
/// # Returns
/// Dict with vote_id, risk_score, flags, payment_status, total_cost and
/// quarantined.
#[pyfunction]
fn cast_vote(py: Python<'_>, request_json: String) -> PyResult<Py<PyAny>> {
    let request: CastVoteRequest = serde_json::from_str(&request_json)
        .map_err(|e| PyValueError::new_err(format!("invalid cast request: {}", e)))?;
    let receipt = with_engine(|engine| engine.cast_vote(request))?;

    let result = PyDict::new(py);
    result.set_item("vote_id", receipt.vote_id.to_string())?;
    result.set_item("risk_score", receipt.risk_score)?;
    result.set_item("flags", PyList::new(py, receipt.flag_tokens()))?;
    result.set_item("payment_status", receipt.payment_status.as_str())?;
    result.set_item("total_cost", receipt.total_cost.to_string())?;
    result.set_item("quarantined", receipt.quarantined)?;

    Ok(result.into())
}

/// Apply a payment status change. Returns the resulting status.
#[pyfunction]
#[pyo3(signature = (vote_id, status, reference=None, processor=None))]
fn update_vote_payment(
    vote_id: String,
    status: String,
    reference: Option<String>,
    processor: Option<String>,
) -> PyResult<String> {
    let vote_id: VoteId = parse(&vote_id)?;
    let status: PaymentStatus = parse(&status)?;
    let actor = processor.map(Actor::Processor).unwrap_or(Actor::System);

    let record = with_engine(|engine| engine.update_vote_payment(vote_id, status, reference.as_deref(), actor))?;
    Ok(record.vote.payment_status.as_str().to_string())
}

#[pyfunction]
fn get_event_analytics(event_id: String) -> PyResult<String> {
    let event_id: EventId = parse(&event_id)?;
    let rollup = with_engine(|engine| engine.get_event_analytics(event_id))?;
    to_json(&rollup)
}

#[pyfunction]
#[pyo3(signature = (event_id, limit=10, sort_by="votes".to_string()))]
fn get_leaderboard(event_id: String, limit: usize, sort_by: String) -> PyResult<String> {
    let event_id: EventId = parse(&event_id)?;
    let sort: SortKey = parse(&sort_by)?;
    let entries = with_engine(|engine| engine.get_leaderboard(event_id, limit, sort))?;
    to_json(&entries)
}

#[pyfunction]
fn get_live_counter(event_id: String) -> PyResult<String> {
    let event_id: EventId = parse(&event_id)?;
    let counter = with_engine(|engine| engine.get_live_counter(event_id))?;
    to_json(&counter)
}

/// Recheck a stored vote.
///
/// Returns (valid, reason); reason is set only when integrity fails.
#[pyfunction]
fn verify_vote(vote_id: String) -> PyResult<(bool, Option<String>)> {
    let vote_id: VoteId = parse(&vote_id)?;
    let guard = ENGINE.read();
    let engine = guard
        .as_ref()
        .ok_or_else(|| PyRuntimeError::new_err("engine not configured; call configure_engine first"))?;

    match engine.verify_vote(vote_id) {
        Ok(_) => Ok((true, None)),
        Err(VoteError::IntegrityViolation { reason, .. }) => Ok((false, Some(reason))),
        Err(e) => Err(to_py_err(e)),
    }
}

/// Audit trail for one vote as JSON.
#[pyfunction]
fn get_audit_trail(vote_id: String) -> PyResult<String> {
    let vote_id: VoteId = parse(&vote_id)?;
    let entries = with_engine(|engine| Ok(engine.audit_trail(vote_id)))?;
    to_json(&entries)
}

/// Python module definition
#[pymodule]
fn pageantry_core(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(configure_engine, m)?)?;
    m.add_function(wrap_pyfunction!(register_event, m)?)?;
    m.add_function(wrap_pyfunction!(register_category, m)?)?;
    m.add_function(wrap_pyfunction!(register_contestant, m)?)?;
    m.add_function(wrap_pyfunction!(cast_vote, m)?)?;
    m.add_function(wrap_pyfunction!(update_vote_payment, m)?)?;
    m.add_function(wrap_pyfunction!(get_event_analytics, m)?)?;
    m.add_function(wrap_pyfunction!(get_leaderboard, m)?)?;
    m.add_function(wrap_pyfunction!(get_live_counter, m)?)?;
    m.add_function(wrap_pyfunction!(verify_vote, m)?)?;
    m.add_function(wrap_pyfunction!(get_audit_trail, m)?)?;
    Ok(())
}
