//! C13: transport surface — the three listeners spec §4.13/§6 describe.
//! Plaintext enrollment RPC, mutual-TLS control channel, and a plaintext
//! localhost-bound admin REST surface. Grounded in the teacher's
//! `rpc::start_rpc_server` accept-loop (`TcpListener::bind` -> spawn a task
//! per connection -> `http1::Builder::new().serve_connection`) and its CORS
//! helpers, adapted from one JSON-RPC 2.0 endpoint into three narrower,
//! purpose-specific surfaces.

pub mod admin;
pub mod control;
pub mod enrollment;
