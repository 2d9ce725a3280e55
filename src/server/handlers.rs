//! Command dispatch: one JSON verb per operation, mapped onto the
//! supervisor and the repositories.

use std::net::IpAddr;

use serde_json::{json, Value};

use super::AppState;
use crate::models::{ModuleKind, QueryProps, QueryType, ThreadProps, UrlListProps, WebsiteProps};
use crate::repository::{
    ConfigRepository, LogRepository, QueryRepository, StorageError, TargetTableRepository,
    ThreadRepository, UrlListRepository, WebsiteRepository,
};

fn ok(text: impl Into<String>) -> Value {
    json!({"error": false, "text": text.into()})
}

fn ok_with_id(text: impl Into<String>, id: i64) -> Value {
    json!({"error": false, "text": text.into(), "id": id})
}

fn fail(text: impl Into<String>) -> Value {
    json!({"error": true, "text": text.into()})
}

/// Spec error classes for the front end.
fn error_class(e: &StorageError) -> &'static str {
    match e {
        StorageError::Invalid(_) | StorageError::IncorrectPath(_) => "invalidinput",
        StorageError::NotFound(_) => "notfound",
        StorageError::NamespaceExists(_) | StorageError::TypeMismatch(_) => "conflict",
        StorageError::Connection(_) => "transient",
        StorageError::Privileges(_) => "permissiondenied",
        StorageError::Corruption(_) => "corruption",
        StorageError::Database(_) if e.is_transient() => "transient",
        _ => "internal",
    }
}

fn storage_fail(e: StorageError) -> Value {
    json!({"error": true, "class": error_class(&e), "text": e.to_string()})
}

trait ArgExt {
    fn arg_str(&self, key: &str) -> Result<&str, Value>;
    fn arg_i64(&self, key: &str) -> Result<i64, Value>;
    fn opt_str(&self, key: &str) -> Option<&str>;
    fn opt_i64(&self, key: &str) -> Option<i64>;
    fn flag(&self, key: &str) -> bool;
}

impl ArgExt for Value {
    fn arg_str(&self, key: &str) -> Result<&str, Value> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| fail(format!("missing argument '{key}'")))
    }

    fn arg_i64(&self, key: &str) -> Result<i64, Value> {
        self.get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| fail(format!("missing argument '{key}'")))
    }

    fn opt_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn opt_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

macro_rules! try_arg {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(response) => return response,
        }
    };
}

pub async fn dispatch(state: &AppState, ip: IpAddr, command: &Value) -> Value {
    let Some(cmd) = command.get("cmd").and_then(Value::as_str) else {
        return fail("missing 'cmd'");
    };

    tracing::debug!("command '{cmd}' from {ip}");

    match cmd {
        // -----------------------------------------------------------------
        // Server control
        // -----------------------------------------------------------------
        "kill" => {
            state.shutdown.notify_waiters();
            ok("server is shutting down")
        }
        "allow" => {
            let addr: IpAddr = match try_arg!(command.arg_str("ip")).parse() {
                Ok(addr) => addr,
                Err(_) => return fail("invalid IP address"),
            };
            state.allowed_ips.write().unwrap().insert(addr);
            ok(format!("{addr} allowed"))
        }
        "disallow" => {
            let addr: IpAddr = match try_arg!(command.arg_str("ip")).parse() {
                Ok(addr) => addr,
                Err(_) => return fail("invalid IP address"),
            };
            if addr == ip {
                return fail("cannot disallow the requesting IP");
            }
            state.allowed_ips.write().unwrap().remove(&addr);
            ok(format!("{addr} disallowed"))
        }

        // -----------------------------------------------------------------
        // Logs
        // -----------------------------------------------------------------
        "log" => {
            let limit = command.opt_i64("limit").unwrap_or(50).clamp(1, 1000) as u32;
            match LogRepository::new(state.db.clone()).tail(command.opt_str("module"), limit) {
                Ok(entries) => json!({
                    "error": false,
                    "entries": entries.iter().map(|e| json!({
                        "id": e.id,
                        "module": e.module,
                        "time": e.time,
                        "entry": e.entry,
                    })).collect::<Vec<_>>(),
                }),
                Err(e) => storage_fail(e),
            }
        }
        "clearlog" => {
            match LogRepository::new(state.db.clone()).clear(command.opt_str("module")) {
                Ok(()) => ok("log cleared"),
                Err(e) => storage_fail(e),
            }
        }

        // -----------------------------------------------------------------
        // Worker control
        // -----------------------------------------------------------------
        "startcrawler" | "startparser" | "startextractor" | "startanalyzer" => {
            let module = module_of(cmd, "start");
            let props = ThreadProps {
                module,
                website: try_arg!(command.arg_i64("website")),
                urllist: try_arg!(command.arg_i64("urllist")),
                config: try_arg!(command.arg_i64("config")),
            };
            match state.supervisor.start(props) {
                Ok(id) => ok_with_id(format!("{} started", module.as_str()), id),
                Err(e) => storage_fail(e),
            }
        }
        "pausecrawler" | "pauseparser" | "pauseextractor" | "pauseanalyzer" => {
            let module = module_of(cmd, "pause");
            let id = try_arg!(command.arg_i64("id"));
            match state.supervisor.pause(id, Some(module)) {
                Ok(true) => ok(format!("{} paused", module.as_str())),
                Ok(false) => fail("thread cannot be paused right now"),
                Err(e) => storage_fail(e),
            }
        }
        "unpausecrawler" | "unpauseparser" | "unpauseextractor" | "unpauseanalyzer" => {
            let module = module_of(cmd, "unpause");
            let id = try_arg!(command.arg_i64("id"));
            match state.supervisor.unpause(id, Some(module)) {
                Ok(()) => ok(format!("{} unpaused", module.as_str())),
                Err(e) => storage_fail(e),
            }
        }
        "stopcrawler" | "stopparser" | "stopextractor" | "stopanalyzer" => {
            let module = module_of(cmd, "stop");
            let id = try_arg!(command.arg_i64("id"));
            match state.supervisor.stop(id, Some(module)) {
                Ok(()) => ok(format!("{} stopping", module.as_str())),
                Err(e) => storage_fail(e),
            }
        }
        "restartthread" => {
            let id = try_arg!(command.arg_i64("id"));
            match state.supervisor.restart(id) {
                Ok(()) => ok("thread restarted"),
                Err(e) => storage_fail(e),
            }
        }
        "removethread" => {
            let id = try_arg!(command.arg_i64("id"));
            match state.supervisor.remove(id) {
                Ok(()) => ok("thread removed"),
                Err(e) => storage_fail(e),
            }
        }
        "resetthread" => {
            // Zero the progress cursor of a stopped thread.
            let id = try_arg!(command.arg_i64("id"));
            if state.supervisor.is_active(id) {
                return fail("stop the thread before resetting its cursor");
            }
            match ThreadRepository::new(state.db.clone()).reset_last(id) {
                Ok(()) => ok("thread cursor reset"),
                Err(e) => storage_fail(e),
            }
        }
        "listthreads" => match ThreadRepository::new(state.db.clone()).list() {
            Ok(entries) => json!({
                "error": false,
                "threads": entries.iter().map(|t| json!({
                    "id": t.id,
                    "module": t.module.as_str(),
                    "status": t.status,
                    "paused": t.paused,
                    "website": t.website,
                    "urllist": t.urllist,
                    "config": t.config,
                    "last": t.last,
                    "progress": t.progress,
                    "runtime": t.runtime,
                    "pausetime": t.pausetime,
                    "running": state.supervisor.is_active(t.id),
                })).collect::<Vec<_>>(),
            }),
            Err(e) => storage_fail(e),
        },

        // -----------------------------------------------------------------
        // Status resets
        // -----------------------------------------------------------------
        "resetparsingstatus" | "resetextractingstatus" | "resetanalyzingstatus" => {
            let module = match cmd {
                "resetparsingstatus" => ModuleKind::Parser,
                "resetextractingstatus" => ModuleKind::Extractor,
                _ => ModuleKind::Analyzer,
            };
            let urllist = try_arg!(command.arg_i64("urllist"));
            match UrlListRepository::new(state.db.clone()).reset_status(urllist, module) {
                Ok(()) => ok(format!("{} status reset", module.as_str())),
                Err(e) => storage_fail(e),
            }
        }

        // -----------------------------------------------------------------
        // Websites
        // -----------------------------------------------------------------
        "addwebsite" => {
            let props = WebsiteProps {
                domain: command.opt_str("domain").map(str::to_string),
                namespace: try_arg!(command.arg_str("namespace")).to_string(),
                name: try_arg!(command.arg_str("name")).to_string(),
                data_dir: command.opt_str("datadir").map(Into::into),
            };
            match WebsiteRepository::new(state.db.clone()).add(&props) {
                Ok(id) => ok_with_id("website added", id),
                Err(e) => storage_fail(e),
            }
        }
        "updatewebsite" => {
            let id = try_arg!(command.arg_i64("id"));
            let props = WebsiteProps {
                domain: command.opt_str("domain").map(str::to_string),
                namespace: try_arg!(command.arg_str("namespace")).to_string(),
                name: try_arg!(command.arg_str("name")).to_string(),
                data_dir: command.opt_str("datadir").map(Into::into),
            };
            match WebsiteRepository::new(state.db.clone()).update(id, &props) {
                Ok(()) => ok("website updated"),
                Err(e) => storage_fail(e),
            }
        }
        "deletewebsite" => {
            let id = try_arg!(command.arg_i64("id"));
            // Workers on the website stop before the cascade delete.
            if let Err(e) = stop_and_remove_threads(state, Some(id), None) {
                return storage_fail(e);
            }
            match WebsiteRepository::new(state.db.clone()).delete(id) {
                Ok(()) => ok("website deleted"),
                Err(e) => storage_fail(e),
            }
        }
        "duplicatewebsite" => {
            let id = try_arg!(command.arg_i64("id"));
            match WebsiteRepository::new(state.db.clone()).duplicate(id) {
                Ok(new_id) => ok_with_id("website duplicated", new_id),
                Err(e) => storage_fail(e),
            }
        }
        "listwebsites" => match WebsiteRepository::new(state.db.clone()).list() {
            Ok(sites) => json!({
                "error": false,
                "websites": sites.iter().map(|w| json!({
                    "id": w.id,
                    "domain": w.domain,
                    "namespace": w.namespace,
                    "name": w.name,
                })).collect::<Vec<_>>(),
            }),
            Err(e) => storage_fail(e),
        },

        // -----------------------------------------------------------------
        // URL lists
        // -----------------------------------------------------------------
        "addurllist" => {
            let website = try_arg!(command.arg_i64("website"));
            let props = UrlListProps {
                namespace: try_arg!(command.arg_str("namespace")).to_string(),
                name: try_arg!(command.arg_str("name")).to_string(),
            };
            match UrlListRepository::new(state.db.clone()).add(website, &props) {
                Ok(id) => ok_with_id("URL list added", id),
                Err(e) => storage_fail(e),
            }
        }
        "updateurllist" => {
            let id = try_arg!(command.arg_i64("id"));
            let props = UrlListProps {
                namespace: try_arg!(command.arg_str("namespace")).to_string(),
                name: try_arg!(command.arg_str("name")).to_string(),
            };
            match UrlListRepository::new(state.db.clone()).update(id, &props) {
                Ok(()) => ok("URL list updated"),
                Err(e) => storage_fail(e),
            }
        }
        "deleteurllist" => {
            let id = try_arg!(command.arg_i64("id"));
            if let Err(e) = stop_and_remove_threads(state, None, Some(id)) {
                return storage_fail(e);
            }
            match UrlListRepository::new(state.db.clone()).delete(id) {
                Ok(()) => ok("URL list deleted"),
                Err(e) => storage_fail(e),
            }
        }
        "listurllists" => {
            let website = try_arg!(command.arg_i64("website"));
            match UrlListRepository::new(state.db.clone()).list(website) {
                Ok(lists) => json!({
                    "error": false,
                    "urllists": lists.iter().map(|l| json!({
                        "id": l.id,
                        "namespace": l.namespace,
                        "name": l.name,
                    })).collect::<Vec<_>>(),
                }),
                Err(e) => storage_fail(e),
            }
        }

        // -----------------------------------------------------------------
        // Queries
        // -----------------------------------------------------------------
        "addquery" => {
            let props = try_arg!(query_props(command));
            match QueryRepository::new(state.db.clone()).add(command.opt_i64("website"), &props) {
                Ok(id) => ok_with_id("query added", id),
                Err(e) => storage_fail(e),
            }
        }
        "updatequery" => {
            let id = try_arg!(command.arg_i64("id"));
            let props = try_arg!(query_props(command));
            match QueryRepository::new(state.db.clone()).update(id, &props) {
                Ok(()) => ok("query updated"),
                Err(e) => storage_fail(e),
            }
        }
        "deletequery" => {
            let id = try_arg!(command.arg_i64("id"));
            match QueryRepository::new(state.db.clone()).delete(id) {
                Ok(()) => ok("query deleted"),
                Err(e) => storage_fail(e),
            }
        }
        "duplicatequery" => {
            let id = try_arg!(command.arg_i64("id"));
            match QueryRepository::new(state.db.clone()).duplicate(id) {
                Ok(new_id) => ok_with_id("query duplicated", new_id),
                Err(e) => storage_fail(e),
            }
        }
        "listqueries" => {
            match QueryRepository::new(state.db.clone()).list(command.opt_i64("website")) {
                Ok(queries) => json!({
                    "error": false,
                    "queries": queries.iter().map(|q| json!({
                        "id": q.id,
                        "website": q.website,
                        "name": q.name,
                        "type": q.query_type.as_str(),
                        "text": q.text,
                    })).collect::<Vec<_>>(),
                }),
                Err(e) => storage_fail(e),
            }
        }

        // -----------------------------------------------------------------
        // Configurations
        // -----------------------------------------------------------------
        "addconfig" => {
            let website = try_arg!(command.arg_i64("website"));
            let module = try_arg!(module_arg(command));
            let name = try_arg!(command.arg_str("name"));
            let Some(config) = command.get("config") else {
                return fail("missing argument 'config'");
            };
            match ConfigRepository::new(state.db.clone()).add(website, module, name, config) {
                Ok(id) => ok_with_id("configuration added", id),
                Err(e) => storage_fail(e),
            }
        }
        "updateconfig" => {
            let id = try_arg!(command.arg_i64("id"));
            let name = try_arg!(command.arg_str("name"));
            let Some(config) = command.get("config") else {
                return fail("missing argument 'config'");
            };
            match ConfigRepository::new(state.db.clone()).update(id, name, config) {
                Ok(()) => ok("configuration updated"),
                Err(e) => storage_fail(e),
            }
        }
        "deleteconfig" => {
            let id = try_arg!(command.arg_i64("id"));
            match ConfigRepository::new(state.db.clone()).delete(id) {
                Ok(()) => ok("configuration deleted"),
                Err(e) => storage_fail(e),
            }
        }
        "duplicateconfig" => {
            let id = try_arg!(command.arg_i64("id"));
            match ConfigRepository::new(state.db.clone()).duplicate(id) {
                Ok(new_id) => ok_with_id("configuration duplicated", new_id),
                Err(e) => storage_fail(e),
            }
        }
        "listconfigs" => {
            let website = try_arg!(command.arg_i64("website"));
            match ConfigRepository::new(state.db.clone()).list(website) {
                Ok(configs) => json!({
                    "error": false,
                    "configs": configs.iter().map(|c| json!({
                        "id": c.id,
                        "module": c.module.as_str(),
                        "name": c.name,
                    })).collect::<Vec<_>>(),
                }),
                Err(e) => storage_fail(e),
            }
        }

        // -----------------------------------------------------------------
        // Target tables
        // -----------------------------------------------------------------
        "listtargettables" => {
            let module = try_arg!(module_arg(command));
            let urllist = try_arg!(command.arg_i64("urllist"));
            match TargetTableRepository::new(state.db.clone()).list(module, urllist) {
                Ok(tables) => json!({
                    "error": false,
                    "tables": tables.iter().map(|(id, name)| json!({
                        "id": id,
                        "name": name,
                    })).collect::<Vec<_>>(),
                }),
                Err(e) => storage_fail(e),
            }
        }
        "deletetargettable" => {
            let module = try_arg!(module_arg(command));
            let id = try_arg!(command.arg_i64("id"));
            match TargetTableRepository::new(state.db.clone()).delete(module, id) {
                Ok(()) => ok("target table deleted"),
                Err(e) => storage_fail(e),
            }
        }

        other => fail(format!("unknown command '{other}'")),
    }
}

/// Module named by a prefixed verb like `startcrawler`.
fn module_of(cmd: &str, prefix: &str) -> ModuleKind {
    ModuleKind::from_str(&cmd[prefix.len()..]).expect("verb suffix is a module name")
}

fn module_arg(command: &Value) -> Result<ModuleKind, Value> {
    let name = command.arg_str("module")?;
    ModuleKind::from_str(name).ok_or_else(|| fail(format!("unknown module '{name}'")))
}

fn query_props(command: &Value) -> Result<QueryProps, Value> {
    let type_name = command.arg_str("type")?;
    let query_type = QueryType::from_str(type_name)
        .ok_or_else(|| fail(format!("unknown query type '{type_name}'")))?;
    Ok(QueryProps {
        name: command.arg_str("name")?.to_string(),
        text: command.arg_str("text")?.to_string(),
        query_type,
        result_bool: command.flag("resultbool"),
        result_single: command.flag("resultsingle"),
        result_multi: command.flag("resultmulti"),
        text_only: command.flag("textonly"),
    })
}

/// Stop and unregister every worker bound to the website or list.
fn stop_and_remove_threads(
    state: &AppState,
    website: Option<i64>,
    urllist: Option<i64>,
) -> crate::repository::Result<()> {
    let stopped = state.supervisor.stop_matching(website, urllist)?;
    for id in stopped {
        state.supervisor.remove(id)?;
    }
    Ok(())
}
