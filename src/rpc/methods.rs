//! RPC method dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::context::AppContext;
use crate::core::advisor;
use crate::core::device::{Device, human_readable_size};
use crate::core::jobs::{JobRequest, WipeService};
use crate::core::registry::WipeJob;

use super::protocol::{DEVICE_ERROR, Request, Response};

pub struct MethodHandler {
    ctx: AppContext,
    service: WipeService,
}

#[derive(Deserialize)]
struct DeviceParams {
    device: String,
}

#[derive(Serialize)]
struct JobStarted {
    job_id: String,
}

fn parse<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

fn device_label(id: &Value, params: Value) -> Result<String, Response> {
    let DeviceParams { device } = parse(id, params)?;
    let device = device.trim().to_string();
    if device.is_empty() {
        return Err(Response::invalid_params(id.clone(), "device must not be empty"));
    }
    Ok(device)
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        let service = WipeService::new(ctx.clone());
        Self { ctx, service }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        let outcome = match request.method.as_str() {
            "daemon.status" => Ok(self.daemon_status(id.clone()).await),
            "health" => Ok(self.health(id.clone()).await),
            "devices.list" => Ok(self.devices_list(id.clone()).await),
            "jobs.get" => self.jobs_get(&id, params).await,
            "jobs.list" => self.jobs_list(&id, params).await,
            "wipe.method" => self.wipe_method(&id, params).await,
            "wipe.boom" => {
                self.start(&id, params, |device| JobRequest::BoomWipe { device })
                    .await
            }
            "wipe.pendrive" => {
                self.start(&id, params, |device| JobRequest::PendriveWipe {
                    device,
                    quick: false,
                })
                .await
            }
            "wipe.quick" => {
                self.start(&id, params, |device| JobRequest::PendriveWipe {
                    device,
                    quick: true,
                })
                .await
            }
            "wipe.encrypt" => {
                self.start(&id, params, |device| JobRequest::EncryptWipe { device })
                    .await
            }
            "backup.encrypt" => {
                self.start(&id, params, |device| JobRequest::EncryptBackup { device })
                    .await
            }
            "backup.restore" => self.backup_restore(&id, params).await,
            _ => Ok(Response::method_not_found(id.clone(), &request.method)),
        };

        outcome.unwrap_or_else(|error_response| error_response)
    }

    async fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            active_jobs: usize,
            total_jobs: usize,
            rpc_bind: String,
            simulation: bool,
            backup_directory: PathBuf,
        }

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.ctx.started_at.elapsed().as_secs(),
                active_jobs: self.ctx.registry.active_count().await,
                total_jobs: self.ctx.registry.len().await,
                rpc_bind: self.ctx.config.rpc_bind.to_string(),
                simulation: self.ctx.config.simulation,
                backup_directory: self.ctx.config.backup_directory.clone(),
            },
        )
    }

    async fn health(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct Health {
            status: &'static str,
            service: &'static str,
            version: &'static str,
            uptime_secs: u64,
            active_jobs: usize,
        }

        Response::success(
            id,
            Health {
                status: "healthy",
                service: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.ctx.started_at.elapsed().as_secs(),
                active_jobs: self.ctx.registry.active_count().await,
            },
        )
    }

    async fn devices_list(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DeviceInfo {
            #[serde(flatten)]
            device: Device,
            size_human: String,
        }

        let resolver = Arc::clone(&self.ctx.resolver);
        let listed = tokio::task::spawn_blocking(move || resolver.list_devices()).await;

        match listed {
            Ok(Ok(devices)) => Response::success(
                id,
                devices
                    .into_iter()
                    .map(|device| DeviceInfo {
                        size_human: human_readable_size(device.size),
                        device,
                    })
                    .collect::<Vec<_>>(),
            ),
            Ok(Err(e)) => Response::error(id, DEVICE_ERROR, format!("{:#}", e)),
            Err(e) => Response::error(id, DEVICE_ERROR, e.to_string()),
        }
    }

    async fn jobs_get(&self, id: &Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        struct Params {
            id: String,
        }

        let Params { id: job_id } = parse(id, params)?;
        Ok(match self.ctx.registry.take(&job_id).await {
            Some(job) => Response::success(id.clone(), job),
            None => Response::job_not_found(id.clone(), &job_id),
        })
    }

    async fn jobs_list(&self, id: &Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            active_only: bool,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            parse(id, params)?
        };

        let jobs: Vec<WipeJob> = self
            .ctx
            .registry
            .list()
            .await
            .into_iter()
            .filter(|j| !params.active_only || !j.status.is_terminal())
            .collect();
        Ok(Response::success(id.clone(), jobs))
    }

    async fn wipe_method(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let device = device_label(id, params)?;
        let advice = advisor::recommend(&self.ctx.resolver, &device).await;
        Ok(Response::success(id.clone(), advice))
    }

    async fn start(
        &self,
        id: &Value,
        params: Value,
        build: impl FnOnce(String) -> JobRequest,
    ) -> Result<Response, Response> {
        let device = device_label(id, params)?;
        let job_id = self.service.start(build(device)).await;
        Ok(Response::success(id.clone(), JobStarted { job_id }))
    }

    async fn backup_restore(&self, id: &Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        struct Params {
            device: String,
            key: String,
        }

        let Params { device, key } = parse(id, params)?;
        let key_hex = Zeroizing::new(key);
        if device.trim().is_empty() {
            return Err(Response::invalid_params(id.clone(), "device must not be empty"));
        }

        let job_id = self
            .service
            .start(JobRequest::Restore {
                device: device.trim().to_string(),
                key_hex,
            })
            .await;
        Ok(Response::success(id.clone(), JobStarted { job_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedResolver;
    use crate::config::AppConfig;
    use crate::rpc::protocol::{INVALID_PARAMS, JOB_NOT_FOUND, METHOD_NOT_FOUND};
    use serde_json::json;

    fn handler() -> MethodHandler {
        let (resolver, sim) = SimulatedResolver::new();
        sim.add_device("TESTSTICK", 8, None);
        MethodHandler::new(AppContext::new(AppConfig::default(), Arc::new(resolver)))
    }

    fn call(method: &str, params: Value) -> Request {
        Request::new(method, Some(params), 1)
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let resp = handler().handle(call("jobs.get", json!({"id": "nope"}))).await;
        assert_eq!(resp.error.unwrap().code, JOB_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_method() {
        let resp = handler().handle(call("wipe.everything", Value::Null)).await;
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_device_is_invalid_params() {
        let h = handler();
        let resp = h.handle(call("wipe.boom", json!({}))).await;
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);

        let resp = h.handle(call("wipe.method", json!({"device": "  "}))).await;
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn advisory_and_devices() {
        let h = handler();
        let resp = h.handle(call("wipe.method", json!({"device": "Kingston USB"}))).await;
        let result = resp.result.unwrap();
        assert_eq!(result["method"], "boom-wipe");
        assert_eq!(result["device_type"], "removable");

        let resp = h.handle(call("devices.list", Value::Null)).await;
        let devices = resp.result.unwrap();
        assert_eq!(devices[0]["name"], "TESTSTICK");
        assert_eq!(devices[0]["size_human"], "8.0 GB");
    }

    #[tokio::test]
    async fn started_job_is_queryable() {
        let h = handler();
        let resp = h.handle(call("wipe.boom", json!({"device": "no such device"}))).await;
        let job_id = resp.result.unwrap()["job_id"].as_str().unwrap().to_string();
        assert!(job_id.starts_with("wipe_"));

        let resp = h.handle(call("jobs.get", json!({"id": job_id}))).await;
        assert_eq!(resp.result.unwrap()["id"], job_id);

        let resp = h.handle(call("jobs.list", Value::Null)).await;
        assert_eq!(resp.result.unwrap().as_array().unwrap().len(), 1);
    }
}
