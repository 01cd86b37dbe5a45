//! Process configuration.
//!
//! Layered: built-in defaults, then `HBMON_*` environment variables,
//! then command-line `--key=value` overrides. The result seeds the
//! runtime parameter record; if the KV store already holds a parameter
//! record (written by a PATCH on some replica) it wins over all of
//! these at startup.

use std::env;

use crate::params::{parse_bool, parse_telemetry_host, Params};

/// Environment variable prefix.
const ENV_PREFIX: &str = "HBMON_";

pub fn usage(prog: &str) -> String {
    format!(
        "Usage: {} [options]\n\
         \n\
         --help                  Help text.\n\
         --debug=num             Debug level. (Default: 0)\n\
         --use_telemetry=yes|no  Inject notifications into the event bus. (Default: yes)\n\
         --telemetry_host=h:p:t  Hostname:port:topic of the event bus.\n\
         --warntime=secs         Seconds before warning of a heartbeat failure. (Default: 10)\n\
         --errtime=secs          Seconds before declaring a node dead. (Default: 30)\n\
         --interval=secs         Heartbeat check interval. (Default: 5)\n\
         --port=num              HTTP port to listen on. (Default: 28500)\n\
         --kv_url=url            Key/value service base URL.\n\
         --sm_url=url            State manager base URL.\n\
         --sm_retries=num        State manager access retries. (Default: 3)\n\
         --sm_timeout=secs       State manager access timeout. (Default: 10)\n\
         --clear_on_gap          Delete stored heartbeat data after a monitoring gap.\n\
         --nosm                  Don't contact the state manager (testing).\n",
        prog
    )
}

/// Build the startup parameters: defaults, environment, command line,
/// in that order. Returns `Ok(None)` when `--help` was requested.
pub fn build() -> Result<Option<Params>, String> {
    let mut p = Params::default();
    apply_env(&mut p, |name| env::var(name).ok());

    let args: Vec<String> = env::args().skip(1).collect();
    if apply_args(&mut p, &args)? {
        return Ok(None);
    }

    // The etcd operator hands out host/port pieces rather than a URL.
    if p.kv_url.is_empty() {
        if let (Ok(host), Ok(port)) = (env::var("ETCD_HOST"), env::var("ETCD_PORT")) {
            p.kv_url = format!("http://{}:{}", host, port);
        }
    }

    Ok(Some(p))
}

/// Apply the environment layer through a lookup function (injectable
/// for tests).
pub fn apply_env(p: &mut Params, lookup: impl Fn(&str) -> Option<String>) {
    let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

    env_int(&get("DEBUG"), &mut p.debug_level);
    env_bool(&get("NOSM"), &mut p.nosm);
    env_bool(&get("USE_TELEMETRY"), &mut p.use_telemetry);
    if let Some(v) = get("TELEMETRY_HOST") {
        p.telemetry_host = v;
    }
    env_int(&get("WARNTIME"), &mut p.warn_secs);
    env_int(&get("ERRTIME"), &mut p.err_secs);
    env_int(&get("INTERVAL"), &mut p.interval_secs);
    if let Some(v) = get("PORT") {
        match v.parse::<u16>() {
            Ok(port) => p.port = port,
            Err(_) => tracing::warn!("invalid {}PORT value '{}'", ENV_PREFIX, v),
        }
    }
    if let Some(v) = get("KV_URL") {
        p.kv_url = v;
    }
    if let Some(v) = get("SM_URL") {
        p.sm_url = v;
    }
    env_int(&get("SM_RETRIES"), &mut p.sm_retries);
    env_int(&get("SM_TIMEOUT"), &mut p.sm_timeout_secs);
    env_bool(&get("CLEAR_ON_GAP"), &mut p.clear_on_gap);
}

fn env_int(val: &Option<String>, target: &mut i64) {
    if let Some(v) = val {
        match v.parse::<u32>() {
            Ok(n) => *target = i64::from(n),
            Err(_) => tracing::warn!("invalid numeric environment value '{}'", v),
        }
    }
}

fn env_bool(val: &Option<String>, target: &mut bool) {
    if let Some(v) = val {
        match parse_bool(v) {
            Some(b) => *target = b,
            None => tracing::warn!("invalid boolean environment value '{}'", v),
        }
    }
}

/// Apply command-line overrides. Returns true when `--help` was seen.
pub fn apply_args(p: &mut Params, args: &[String]) -> Result<bool, String> {
    for arg in args {
        if arg == "--help" {
            return Ok(true);
        }
        if arg == "--nosm" {
            p.nosm = true;
            continue;
        }
        if arg == "--clear_on_gap" {
            p.clear_on_gap = true;
            continue;
        }

        let (key, val) = arg
            .strip_prefix("--")
            .and_then(|kv| kv.split_once('='))
            .ok_or_else(|| format!("Unrecognized option '{}'", arg))?;

        match key {
            "debug" => arg_int(key, val, &mut p.debug_level)?,
            "use_telemetry" => {
                p.use_telemetry =
                    parse_bool(val).ok_or_else(|| bad_value(key, val))?;
            }
            "telemetry_host" => {
                parse_telemetry_host(val)?;
                p.telemetry_host = val.to_string();
            }
            "warntime" => arg_int(key, val, &mut p.warn_secs)?,
            "errtime" => arg_int(key, val, &mut p.err_secs)?,
            "interval" => arg_int(key, val, &mut p.interval_secs)?,
            "port" => {
                p.port = val.parse::<u16>().map_err(|_| bad_value(key, val))?;
            }
            "kv_url" => p.kv_url = val.to_string(),
            "sm_url" => p.sm_url = val.to_string(),
            "sm_retries" => arg_int(key, val, &mut p.sm_retries)?,
            "sm_timeout" => arg_int(key, val, &mut p.sm_timeout_secs)?,
            _ => return Err(format!("Unrecognized option '--{}'", key)),
        }
    }
    Ok(false)
}

fn arg_int(key: &str, val: &str, target: &mut i64) -> Result<(), String> {
    *target = val
        .parse::<u32>()
        .map(i64::from)
        .map_err(|_| bad_value(key, val))?;
    Ok(())
}

fn bad_value(key: &str, val: &str) -> String {
    format!("Invalid value '{}' for option '--{}'", val, key)
}

/// This replica's instance name for outbound User-Agent headers.
pub fn service_instance_name() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "hbmon".to_string())
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
