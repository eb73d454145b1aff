//! Login phase
//!
//! A deliberately small login engine: AuthMethod=None only, text key
//! negotiation into [`SessionParams`] and [`ConnParams`], then hand-off of
//! the connection to the full-feature engine. Handles new sessions, session
//! reinstatement (same ISID and names, TSIH 0), adding connections to an
//! existing session, and connection reinstatement (a CID already in use).

use crate::connection::{ConnParams, ConnState, Connection};
use crate::digest::{DigestSettings, DigestType};
use crate::error::{IscsiError, IscsiResult};
use crate::lifecycle;
use crate::pdu::{login_status, opcode, serialize_text_parameters, IscsiPdu, LoginRequest, MAX_DATA_SEGMENT_LENGTH};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionInit, SessionParams, SessionState, SessionType};
use crate::target::TargetContext;
use crate::transport::{TcpTransport, Transport};
use log::{debug, info, warn};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

const STAGE_SECURITY: u8 = 0;
const STAGE_OPERATIONAL: u8 = 1;
const STAGE_FULL_FEATURE: u8 = 3;

/// Keys only meaningful for normal sessions
const SESSION_ONLY_KEYS: &[&str] = &[
    "MaxConnections",
    "InitialR2T",
    "ImmediateData",
    "MaxBurstLength",
    "FirstBurstLength",
    "MaxOutstandingR2T",
    "DataPDUInOrder",
    "DataSequenceInOrder",
];

/// A login failure to report with a Login Response before closing
struct LoginFailure {
    class: u8,
    detail: u8,
    reason: String,
}

impl LoginFailure {
    fn initiator(detail: u8, reason: impl Into<String>) -> Self {
        LoginFailure {
            class: login_status::INITIATOR_ERROR,
            detail,
            reason: reason.into(),
        }
    }
}

/// Everything learned over the login PDUs of one connection
struct LoginState {
    isid: [u8; 6],
    tsih: u16,
    cid: u16,
    cmd_sn: u32,
    stat_sn: u32,
    first: bool,
    initiator_name: Option<String>,
    target_name: Option<String>,
    session_type: SessionType,
    params: SessionParams,
    conn_params: ConnParams,
    tpgt_sent: bool,
}

impl LoginState {
    fn new(ctx: &TargetContext) -> Self {
        LoginState {
            isid: [0; 6],
            tsih: 0,
            cid: 0,
            cmd_sn: 0,
            stat_sn: 0,
            first: true,
            initiator_name: None,
            target_name: None,
            session_type: SessionType::Normal,
            params: SessionParams::offer(&ctx.config),
            conn_params: ConnParams {
                max_recv_data_segment_length: ctx.config.max_recv_data_segment_length,
                ..ConnParams::default()
            },
            tpgt_sent: false,
        }
    }

    fn take_stat_sn(&mut self) -> u32 {
        let sn = self.stat_sn;
        self.stat_sn = self.stat_sn.wrapping_add(1);
        sn
    }

    /// Negotiate the keys of one login request; returns the reply keys
    fn negotiate(&mut self, ctx: &TargetContext, req: &LoginRequest) -> Result<Vec<(String, String)>, LoginFailure> {
        if let Some((_, v)) = req.parameters.iter().find(|(k, _)| k == "SessionType") {
            self.session_type = match v.as_str() {
                "Discovery" => SessionType::Discovery,
                "Normal" => SessionType::Normal,
                other => {
                    return Err(LoginFailure::initiator(
                        login_status::DETAIL_NONE,
                        format!("unknown SessionType {}", other),
                    ))
                }
            };
        }
        let discovery = self.session_type == SessionType::Discovery;

        let mut reply = Vec::new();
        let mut session_keys = Vec::new();
        for (key, value) in &req.parameters {
            match key.as_str() {
                "SessionType" | "InitiatorAlias" => {}
                "InitiatorName" => self.initiator_name = Some(value.clone()),
                "TargetName" => self.target_name = Some(value.clone()),
                "AuthMethod" => {
                    if !value.split(',').any(|m| m == "None") {
                        return Err(LoginFailure::initiator(
                            login_status::DETAIL_AUTH_FAILED,
                            format!("no acceptable AuthMethod in {}", value),
                        ));
                    }
                    reply.push((key.clone(), "None".to_string()));
                }
                "HeaderDigest" | "DataDigest" => {
                    let chosen = DigestType::from_key(value);
                    if key == "HeaderDigest" {
                        self.conn_params.digests.header = chosen;
                    } else {
                        self.conn_params.digests.data = chosen;
                    }
                    reply.push((key.clone(), chosen.as_key().to_string()));
                }
                "MaxRecvDataSegmentLength" => {
                    if let Ok(v) = value.parse::<u32>() {
                        self.conn_params.max_xmit_data_segment_length = v.clamp(512, MAX_DATA_SEGMENT_LENGTH);
                    }
                    reply.push((key.clone(), ctx.config.max_recv_data_segment_length.to_string()));
                }
                k if discovery && SESSION_ONLY_KEYS.contains(&k) => {
                    reply.push((key.clone(), "Irrelevant".to_string()));
                }
                k => {
                    if self.params.apply_initiator_param(k, value) {
                        session_keys.push(key.clone());
                    } else {
                        debug!("login key {}={} not understood", key, value);
                        reply.push((key.clone(), "NotUnderstood".to_string()));
                    }
                }
            }
        }
        let negotiated = self.params.response_params();
        for key in session_keys {
            if let Some(entry) = negotiated.iter().find(|(k, _)| *k == key) {
                reply.push(entry.clone());
            }
        }
        if !discovery && !self.tpgt_sent && self.target_name.is_some() {
            reply.push(("TargetPortalGroupTag".to_string(), ctx.portal_group_tag.to_string()));
            self.tpgt_sent = true;
        }
        Ok(reply)
    }
}

fn send_response(
    transport: &TcpTransport,
    state: &mut LoginState,
    req: &LoginRequest,
    window: (u32, u32),
    transit: bool,
    nsg: u8,
    keys: &[(String, String)],
) -> IscsiResult<()> {
    let stat_sn = state.take_stat_sn();
    let pdu = IscsiPdu::login_response(
        state.isid,
        state.tsih,
        stat_sn,
        window.0,
        window.1,
        login_status::SUCCESS,
        login_status::DETAIL_NONE,
        req.csg,
        nsg,
        transit,
        req.itt,
        serialize_text_parameters(keys),
    );
    transport.send(&[&pdu.to_bytes()])?;
    Ok(())
}

fn send_failure(
    transport: &TcpTransport,
    state: &mut LoginState,
    req: &LoginRequest,
    failure: &LoginFailure,
) -> IscsiResult<()> {
    let stat_sn = state.take_stat_sn();
    let pdu = IscsiPdu::login_response(
        state.isid,
        0,
        stat_sn,
        state.cmd_sn,
        state.cmd_sn,
        failure.class,
        failure.detail,
        req.csg,
        req.nsg,
        false,
        req.itt,
        Vec::new(),
    );
    transport.send(&[&pdu.to_bytes()])?;
    Ok(())
}

/// Run the login phase on a freshly accepted connection
///
/// On success the connection's receive and transmit threads are running
/// when this returns.
pub(crate) fn handle_new_connection(
    stream: TcpStream,
    ctx: Arc<TargetContext>,
    registry: Arc<SessionRegistry>,
) -> IscsiResult<()> {
    let transport = Arc::new(TcpTransport::new(stream)?);
    transport.stream().set_read_timeout(Some(LOGIN_TIMEOUT))?;
    let peer = transport.peer();
    debug!("login from {}", peer);

    let mut state = LoginState::new(&ctx);
    loop {
        let mut reader = transport.stream();
        let pdu = IscsiPdu::read_from(&mut reader, DigestSettings::none())?;
        if pdu.opcode != opcode::LOGIN_REQUEST {
            return Err(IscsiError::protocol(format!(
                "{} from {} during login",
                pdu.opcode_name(),
                peer
            )));
        }
        let req = pdu.parse_login_request()?;
        if state.first {
            state.first = false;
            state.isid = req.isid;
            state.tsih = req.tsih;
            state.cid = req.cid;
            state.cmd_sn = req.cmd_sn;
            state.stat_sn = if req.tsih == 0 { rand::random() } else { req.exp_stat_sn };
        }

        let window = (state.cmd_sn, state.cmd_sn.wrapping_add(ctx.config.cmdsn_depth.saturating_sub(1)));
        let step = if req.cont {
            Err(LoginFailure::initiator(
                login_status::DETAIL_NONE,
                "text continuation during login is not supported",
            ))
        } else {
            state.negotiate(&ctx, &req)
        };
        let keys = match step {
            Ok(keys) => keys,
            Err(failure) => {
                warn!("login from {} refused: {}", peer, failure.reason);
                send_failure(&transport, &mut state, &req, &failure)?;
                return Err(IscsiError::session(failure.reason));
            }
        };

        let valid_transition = matches!(
            (req.csg, req.nsg),
            (STAGE_SECURITY, STAGE_OPERATIONAL) | (STAGE_SECURITY, STAGE_FULL_FEATURE) | (STAGE_OPERATIONAL, STAGE_FULL_FEATURE)
        );
        if !req.transit || !valid_transition {
            send_response(&transport, &mut state, &req, window, false, req.csg, &keys)?;
            continue;
        }
        if req.nsg != STAGE_FULL_FEATURE {
            send_response(&transport, &mut state, &req, window, true, req.nsg, &keys)?;
            continue;
        }

        let leading = state.tsih == 0;
        return match complete_login(&ctx, &registry, &mut state) {
            Ok(sess) => hand_off(transport, &sess, &mut state, &req, &keys, leading),
            Err(failure) => {
                warn!("login from {} refused: {}", peer, failure.reason);
                send_failure(&transport, &mut state, &req, &failure)?;
                Err(IscsiError::session(failure.reason))
            }
        };
    }
}

/// Find or create the session this connection joins
fn complete_login(
    ctx: &Arc<TargetContext>,
    registry: &Arc<SessionRegistry>,
    state: &mut LoginState,
) -> Result<Arc<Session>, LoginFailure> {
    let Some(initiator_name) = state.initiator_name.clone() else {
        return Err(LoginFailure::initiator(
            login_status::DETAIL_MISSING_PARAMETER,
            "InitiatorName missing",
        ));
    };
    let target_name = match state.session_type {
        SessionType::Discovery => state.target_name.clone().unwrap_or_default(),
        SessionType::Normal => {
            let Some(name) = state.target_name.clone() else {
                return Err(LoginFailure::initiator(
                    login_status::DETAIL_MISSING_PARAMETER,
                    "TargetName missing",
                ));
            };
            if !registry.has_target(&name) {
                return Err(LoginFailure::initiator(
                    login_status::DETAIL_NOT_FOUND,
                    format!("unknown target {}", name),
                ));
            }
            name
        }
    };

    if state.tsih == 0 {
        if state.session_type == SessionType::Normal {
            if let Some(old) = registry.find_by_identity(&state.isid, &initiator_name, &target_name) {
                info!(
                    "{} reinstating session TSIH {}",
                    initiator_name, old.tsih
                );
                lifecycle::free_session(&old);
            }
        }
        let tsih = registry.allocate_tsih();
        state.tsih = tsih;
        let session = Session::new(
            SessionInit {
                tsih,
                isid: state.isid,
                session_type: state.session_type,
                initiator_name,
                target_name,
                params: state.params.clone(),
                cmd_sn: state.cmd_sn,
            },
            Arc::clone(ctx),
            Arc::downgrade(registry),
        );
        registry.insert(Arc::clone(&session));
        return Ok(session);
    }

    let session = match registry.find(state.tsih) {
        Some(s) if s.isid == state.isid && !s.flags().closed => s,
        _ => {
            return Err(LoginFailure::initiator(
                login_status::DETAIL_SESSION_DOES_NOT_EXIST,
                format!("no session with TSIH {}", state.tsih),
            ))
        }
    };
    if session.state() == SessionState::Failed {
        info!("TSIH {}: continuing failed session", session.tsih);
        lifecycle::stop_time2retain(&session);
        session.flags().continuation = true;
        session.state.set(SessionState::InContinue);
    }
    match session.find_connection(state.cid) {
        Some(old) => {
            info!(
                "TSIH {}: CID {} logging in again, reinstating the old connection",
                session.tsih, state.cid
            );
            old.flags().replaced = true;
            lifecycle::cause_connection_reinstatement(&old, true);
        }
        None if session.connection_count() as u32 >= session.params.max_connections => {
            return Err(LoginFailure::initiator(
                login_status::DETAIL_TOO_MANY_CONNECTIONS,
                format!("TSIH {} already has {} connections", session.tsih, session.connection_count()),
            ));
        }
        None => {}
    }
    Ok(session)
}

/// Send the final login response and start the full-feature threads
fn hand_off(
    transport: Arc<TcpTransport>,
    sess: &Arc<Session>,
    state: &mut LoginState,
    req: &LoginRequest,
    keys: &[(String, String)],
    leading: bool,
) -> IscsiResult<()> {
    let stat_sn = state.stat_sn;
    let window = sess.cmd_sn_window();
    if let Err(e) = send_response(&transport, state, req, window, true, STAGE_FULL_FEATURE, keys) {
        if leading {
            lifecycle::close_session(sess);
        }
        return Err(e);
    }
    transport.stream().set_read_timeout(None)?;

    let conn = Connection::new(
        state.cid,
        Arc::clone(sess),
        state.conn_params,
        transport,
        stat_sn.wrapping_add(1),
    );
    conn.set_state(ConnState::LoggedIn);
    sess.add_connection(Arc::clone(&conn));
    sess.state.set(SessionState::LoggedIn);
    info!(
        "{} logged in: TSIH {} CID {} ({:?}, ERL {}) from {}",
        sess.initiator_name,
        sess.tsih,
        conn.cid,
        sess.session_type,
        sess.erl(),
        conn.peer()
    );

    if let Err(e) = lifecycle::start_connection_threads(&conn) {
        warn!("TSIH {} CID {}: could not start connection: {}", sess.tsih, conn.cid, e);
        if sess.remove_connection(&conn) == 0 {
            lifecycle::close_session(sess);
        }
        return Err(e);
    }
    Ok(())
}
