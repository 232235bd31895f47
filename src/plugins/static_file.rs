//! Serves files straight off disk and triggers FastCGI dispatch for
//! extension-matched routes, grounded in the teacher's
//! `handlers/get_handler.rs::handle_get`.

use crate::chunk::Chunk;
use crate::connection::Connection;
use crate::fastcgi::handler::FcgiHandlerContext;
use crate::http::{generate_autoindex, get_mime_type};
use crate::plugin::{HookResult, Plugin};
use crate::server::ServerShared;

pub struct StaticFilePlugin;

impl Plugin for StaticFilePlugin {
    fn name(&self) -> &'static str {
        "static_file"
    }

    fn handle_physical_path(&self, conn: &mut Connection) -> HookResult {
        let Some(r_cfg) = conn.r_cfg.clone() else {
            return HookResult::GoOn;
        };
        let relative = conn.request.url.strip_prefix(&r_cfg.path).unwrap_or(&conn.request.url);
        let mut path = std::path::PathBuf::from(&r_cfg.root);
        path.push(relative.trim_start_matches('/'));
        conn.physical_path = path;
        HookResult::GoOn
    }

    /// If the route has a configured FastCGI extension matching the URL,
    /// selects a host/process and installs an `FcgiHandlerContext`.
    /// Otherwise serves the physical path directly off disk.
    fn handle_start_backend(&self, conn: &mut Connection, shared: &mut ServerShared) -> HookResult {
        let Some(s_cfg) = conn.s_cfg.clone() else {
            return HookResult::Error(500);
        };

        if let Some(ext_cfg) = s_cfg.find_fastcgi(&conn.request.url) {
            let ext_idx = shared
                .fastcgi
                .iter()
                .position(|e| e.server_name == s_cfg.server_name && e.pattern == ext_cfg.extension);
            if let Some(ext_idx) = ext_idx {
                let picked = {
                    let ext = &shared.fastcgi[ext_idx];
                    ext.pick_host()
                        .and_then(|host_idx| ext.hosts[host_idx].pick_proc().map(|proc_id| (host_idx, proc_id, ext.role)))
                };
                if let Some((host_idx, proc_id, role)) = picked {
                    // Marks the process used here, while it's still selected
                    // under the same load snapshot `pick_proc` read, so a
                    // second request racing in before this one connects
                    // doesn't also land on the now-least-loaded process.
                    if let Some(proc) = shared.fastcgi[ext_idx].hosts[host_idx].proc_mut(proc_id) {
                        proc.mark_used();
                    }

                    let mut req_id_alloc = std::mem::take(&mut shared.fcgi_request_ids);
                    let request_id = req_id_alloc.alloc();
                    shared.fcgi_request_ids = req_id_alloc;

                    conn.fcgi_ext_idx = Some(ext_idx);
                    conn.fcgi_ctx = Some(FcgiHandlerContext::new(host_idx, proc_id, request_id, role));
                    return HookResult::GoOn;
                }
            }
            return HookResult::Finished(503);
        }

        match serve_static(conn) {
            Ok(()) => HookResult::GoOn,
            Err(code) => HookResult::Finished(code),
        }
    }
}

fn serve_static(conn: &mut Connection) -> Result<(), u16> {
    let Some(r_cfg) = conn.r_cfg.clone() else {
        return Err(500);
    };
    let mut path = conn.physical_path.clone();

    if path.is_dir() {
        if !r_cfg.default_file.is_empty() {
            path.push(&r_cfg.default_file);
        } else if r_cfg.autoindex {
            conn.response = generate_autoindex(&path, &conn.request.url);
            return Ok(());
        } else {
            return Err(403);
        }
    }

    let file = std::fs::File::open(&path).map_err(|_| 404u16)?;
    let metadata = file.metadata().map_err(|_| 500u16)?;
    let len = metadata.len();
    let mime = get_mime_type(path.extension().and_then(|s| s.to_str()));

    conn.response.set_status_code(200);
    conn.response.set_header("content-length", &len.to_string());
    conn.response.set_header("content-type", mime);
    conn.response_queue.append_file(Chunk::from_static_file(path, file, len));
    Ok(())
}
