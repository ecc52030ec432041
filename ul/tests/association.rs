use dicom_ul_engine::pdu::{
    AbortRQSource, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, PresentationContextProposed,
    PresentationContextResultReason, UserVariableItem,
};
use dicom_ul_engine::{
    abort_association, acknowledge_association, acknowledge_release, initialize_network,
    read_next_pdv, read_pdvs, receive_association_request, reject_association,
    release_association, request_association, write_pdu, write_pdvs, AssociationKey,
    AssociationParameters, BlockMode, ErrorKind, Incoming, NetworkKey, NetworkOptions,
    NetworkRole, Pdv, PresentationContext, RejectReason, Role, ScRole, State,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Barrier};
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "STORE-SCU";
static SCP_AE_TITLE: &str = "STORE-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static DIGITAL_MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

const TIMEOUT: Duration = Duration::from_secs(10);

fn network(options: NetworkOptions) -> Result<(Arc<NetworkKey>, SocketAddr)> {
    let network = initialize_network(
        options
            .role(NetworkRole::Both)
            .listen_address("localhost:0")
            .artim_timeout(TIMEOUT),
    )?;
    let addr = network.local_addr().ok_or("no listening address")?;
    Ok((Arc::new(network), addr))
}

fn requestor_params(addr: SocketAddr) -> Result<AssociationParameters> {
    let mut params = AssociationParameters::new();
    params.calling_ae_title = SCU_AE_TITLE.to_string();
    params.called_ae_title = SCP_AE_TITLE.to_string();
    params.called_presentation_address = format!("localhost:{}", addr.port());
    params.add_requested_presentation_context(PresentationContext::new(
        1,
        VERIFICATION_SOP_CLASS,
        [IMPLICIT_VR_LE],
    ))?;
    Ok(params)
}

/// Accept one association, accepting the contexts of the verification SOP class.
fn accept(network: &NetworkKey) -> Result<(AssociationKey, AssociationParameters)> {
    let mut params = AssociationParameters::new();
    let mut key = receive_association_request(
        network,
        &mut params,
        Incoming::Accept(BlockMode::Deadline(TIMEOUT)),
    )?;
    assert_eq!(key.state(), State::Sta3);
    assert_eq!(key.role(), Role::Acceptor);

    let requested: Vec<_> = params.requested_presentation_contexts.clone();
    for pc in requested {
        if pc.abstract_syntax == VERIFICATION_SOP_CLASS {
            params.accept_presentation_context(
                pc.id,
                pc.proposed_transfer_syntaxes[0].clone(),
                ScRole::Default,
            )?;
        } else {
            params.reject_presentation_context(
                pc.id,
                PresentationContextResultReason::AbstractSyntaxNotSupported,
            )?;
        }
    }
    acknowledge_association(&mut key, &mut params)?;
    Ok((key, params))
}

fn spawn_acceptor<T, F>(network: &Arc<NetworkKey>, f: F) -> JoinHandle<Result<T>>
where
    T: Send + 'static,
    F: FnOnce(&NetworkKey) -> Result<T> + Send + 'static,
{
    let network = Arc::clone(network);
    spawn(move || f(&network))
}

/// Negotiate an association and release it.
#[test]
fn associate_and_release() -> Result<()> {
    let (network, addr) = network(NetworkOptions::new())?;

    let acceptor = spawn_acceptor(&network, |network| {
        let (mut key, params) = accept(network)?;
        assert_eq!(params.calling_ae_title, SCU_AE_TITLE);
        assert_eq!(params.called_ae_title, SCP_AE_TITLE);
        assert_eq!(params.requested_presentation_contexts.len(), 2);
        assert_eq!(params.peer_max_pdu, 16384);

        let err = read_pdvs(&mut key, BlockMode::Deadline(TIMEOUT)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerRequestedRelease);
        assert_eq!(key.state(), State::Sta8);
        acknowledge_release(&mut key)?;
        assert_eq!(key.state(), State::Sta1);
        Ok(())
    });

    let mut params = requestor_params(addr)?;
    params.max_pdu = 16384;
    params.add_requested_presentation_context(PresentationContext::new(
        3,
        DIGITAL_MG_STORAGE_SOP_CLASS,
        [IMPLICIT_VR_LE, EXPLICIT_VR_LE],
    ))?;
    let mut key = request_association(&network, &mut params)?;
    assert_eq!(key.state(), State::Sta6);
    assert!(key.is_open());

    let accepted: Vec<_> = params
        .accepted_presentation_contexts
        .iter()
        .filter(|pc| pc.is_accepted())
        .collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].id, 1);
    assert_eq!(
        accepted[0].accepted_transfer_syntax.as_deref(),
        Some(IMPLICIT_VR_LE)
    );
    let rejected = params
        .accepted_presentation_context(3)
        .ok_or("missing result for context 3")?;
    assert_eq!(
        rejected.result,
        Some(PresentationContextResultReason::AbstractSyntaxNotSupported)
    );
    assert_eq!(params.responding_ae_title, SCP_AE_TITLE);

    release_association(&mut key)?;
    assert_eq!(key.state(), State::Sta1);
    assert!(!key.is_open());

    acceptor.join().map_err(|_| "acceptor panicked")??;
    Ok(())
}

/// Send values larger than the maximum PDU length of the peer.
#[test]
fn pdvs_are_fragmented_and_reassembled() -> Result<()> {
    const LEN: usize = 40_000;
    let (network, addr) = network(NetworkOptions::new())?;

    let acceptor = spawn_acceptor(&network, |network| {
        let (mut key, _params) = accept(network)?;

        let command = read_next_pdv(&mut key, BlockMode::Deadline(TIMEOUT))?;
        assert!(command.is_command());
        assert!(command.is_last);
        assert_eq!(&command.data[..], &[1, 2, 3, 4]);

        let mut fragments = Vec::new();
        loop {
            let pdv = read_next_pdv(&mut key, BlockMode::Deadline(TIMEOUT))?;
            assert!(!pdv.is_command());
            assert_eq!(pdv.presentation_context_id, 1);
            let is_last = pdv.is_last;
            fragments.push(pdv);
            if is_last {
                break;
            }
        }

        // answer with a small data set
        write_pdvs(&mut key, &[Pdv::data_set(1, vec![0xAB; 16])])?;

        let err = read_pdvs(&mut key, BlockMode::Deadline(TIMEOUT)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerRequestedRelease);
        acknowledge_release(&mut key)?;
        Ok(fragments)
    });

    let mut params = requestor_params(addr)?;
    let mut key = request_association(&network, &mut params)?;
    assert_eq!(key.peer_max_pdu(), 16384);

    let data: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    write_pdvs(
        &mut key,
        &[Pdv::command(1, vec![1, 2, 3, 4]), Pdv::data_set(1, data.clone())],
    )?;

    let reply = read_next_pdv(&mut key, BlockMode::Deadline(TIMEOUT))?;
    assert_eq!(reply.data.len(), 16);
    assert!(reply.is_last);

    release_association(&mut key)?;

    let fragments = acceptor.join().map_err(|_| "acceptor panicked")??;
    let lengths: Vec<_> = fragments.iter().map(|pdv| pdv.data.len()).collect();
    assert_eq!(lengths, vec![16372, 16372, LEN - 2 * 16372]);
    let reassembled: Vec<u8> = fragments
        .iter()
        .flat_map(|pdv| pdv.data.iter().copied())
        .collect();
    assert_eq!(reassembled, data);
    Ok(())
}

#[test]
fn rejected_association_reports_diagnostics() -> Result<()> {
    let (network, addr) = network(NetworkOptions::new())?;

    let acceptor = spawn_acceptor(&network, |network| {
        let mut params = AssociationParameters::new();
        let mut key = receive_association_request(
            network,
            &mut params,
            Incoming::Accept(BlockMode::Deadline(TIMEOUT)),
        )?;
        reject_association(
            &mut key,
            &mut params,
            RejectReason::new(
                AssociationRJResult::Transient,
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
        )?;
        assert_eq!(key.state(), State::Sta1);
        Ok(())
    });

    let mut params = requestor_params(addr)?;
    let err = request_association(&network, &mut params).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssociationRejected);
    assert_eq!(
        params.rejection,
        Some(AssociationRJ {
            result: AssociationRJResult::Transient,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized
            ),
        })
    );

    acceptor.join().map_err(|_| "acceptor panicked")??;
    Ok(())
}

#[test]
fn reserved_reject_reason_is_refused() -> Result<()> {
    let (network, addr) = network(NetworkOptions::new())?;

    let acceptor = spawn_acceptor(&network, |network| {
        let mut params = AssociationParameters::new();
        let mut key = receive_association_request(
            network,
            &mut params,
            Incoming::Accept(BlockMode::Deadline(TIMEOUT)),
        )?;
        let err = reject_association(
            &mut key,
            &mut params,
            RejectReason::permanent(AssociationRJServiceUserReason::Reserved(5)),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalServiceParameter);
        assert_eq!(key.state(), State::Sta3);

        reject_association(
            &mut key,
            &mut params,
            RejectReason::permanent(AssociationRJServiceUserReason::NoReasonGiven),
        )?;
        Ok(())
    });

    let mut params = requestor_params(addr)?;
    let err = request_association(&network, &mut params).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AssociationRejected);

    acceptor.join().map_err(|_| "acceptor panicked")??;
    Ok(())
}

#[test]
fn abort_is_reported_to_the_peer() -> Result<()> {
    let (network, addr) = network(NetworkOptions::new())?;

    let acceptor = spawn_acceptor(&network, |network| {
        let (mut key, _params) = accept(network)?;
        let err = read_pdvs(&mut key, BlockMode::Deadline(TIMEOUT)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerAbortedAssociation);
        assert_eq!(key.state(), State::Sta1);
        assert!(!key.is_open());
        Ok(())
    });

    let mut params = requestor_params(addr)?;
    let mut key = request_association(&network, &mut params)?;
    abort_association(&mut key)?;
    assert_eq!(key.state(), State::Sta1);

    acceptor.join().map_err(|_| "acceptor panicked")??;
    Ok(())
}

/// A receive limit above the supported range is announced as the largest one,
/// and PDUs filling it are accepted.
#[test]
fn large_receive_limit_is_announced_as_enforced() -> Result<()> {
    const PAYLOAD_LENGTH: usize = 200_000;
    let (network, addr) = network(NetworkOptions::new().strict(true))?;

    let acceptor = spawn_acceptor(&network, |network| {
        let (mut key, params) = accept(network)?;
        assert_eq!(params.peer_max_pdu, 131_072);
        assert_eq!(key.max_pdv_output(), 131_060);

        let payload: Vec<u8> = (0..=255).cycle().take(PAYLOAD_LENGTH).collect();
        write_pdvs(&mut key, &[Pdv::data_set(1, payload)])?;

        let err = read_pdvs(&mut key, BlockMode::Deadline(TIMEOUT)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerRequestedRelease);
        acknowledge_release(&mut key)?;
        Ok(())
    });

    let mut params = requestor_params(addr)?;
    params.max_pdu = 262_144;
    let mut key = request_association(&network, &mut params)?;
    assert_eq!(params.max_pdu, 131_072);
    assert_eq!(key.max_pdu(), 131_072);

    let mut received = Vec::new();
    loop {
        let pdv = read_next_pdv(&mut key, BlockMode::Deadline(TIMEOUT))?;
        received.extend_from_slice(&pdv.data);
        if pdv.is_last {
            break;
        }
    }
    assert_eq!(received.len(), PAYLOAD_LENGTH);
    assert!(received.iter().zip((0..=255).cycle()).all(|(a, b)| *a == b));

    release_association(&mut key)?;
    acceptor.join().map_err(|_| "acceptor panicked")??;
    Ok(())
}

#[test]
fn simultaneous_release_requests_are_resolved() -> Result<()> {
    let (network, addr) = network(NetworkOptions::new())?;
    let barrier = Arc::new(Barrier::new(2));

    let acceptor_barrier = Arc::clone(&barrier);
    let acceptor = spawn_acceptor(&network, move |network| {
        let (mut key, _params) = accept(network)?;
        acceptor_barrier.wait();
        release_association(&mut key)?;
        assert_eq!(key.state(), State::Sta1);
        Ok(())
    });

    let mut params = requestor_params(addr)?;
    let mut key = request_association(&network, &mut params)?;
    barrier.wait();
    release_association(&mut key)?;
    assert_eq!(key.state(), State::Sta1);

    acceptor.join().map_err(|_| "acceptor panicked")??;
    Ok(())
}

#[test]
fn silent_requestor_expires_artim_timer() -> Result<()> {
    let network = initialize_network(
        NetworkOptions::new()
            .role(NetworkRole::Acceptor)
            .listen_address("localhost:0")
            .artim_timeout(Duration::from_millis(300)),
    )?;
    let addr = network.local_addr().ok_or("no listening address")?;

    // connect, then say nothing
    let _stream = TcpStream::connect(addr)?;

    let start = Instant::now();
    let mut params = AssociationParameters::new();
    let err = receive_association_request(
        &network,
        &mut params,
        Incoming::Accept(BlockMode::Deadline(TIMEOUT)),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadTimeout);
    assert!(start.elapsed() < TIMEOUT);
    Ok(())
}

#[test]
fn unsupported_protocol_version_is_rejected() -> Result<()> {
    let (network, addr) = network(NetworkOptions::new())?;

    let requestor = spawn(move || -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(addr)?;
        let rq = AssociationRQ {
            protocol_version: 2,
            calling_ae_title: SCU_AE_TITLE.to_string(),
            called_ae_title: SCP_AE_TITLE.to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            }],
            user_variables: vec![UserVariableItem::MaxLength(16384)],
        };
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, &rq.into())?;
        stream.write_all(&bytes)?;

        let mut rj = vec![0; 10];
        stream.read_exact(&mut rj)?;
        Ok(rj)
    });

    let mut params = AssociationParameters::new();
    let err = receive_association_request(
        &network,
        &mut params,
        Incoming::Accept(BlockMode::Deadline(TIMEOUT)),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedPeerProtocol);

    let rj = requestor.join().map_err(|_| "requestor panicked")??;
    // permanent, service provider (ACSE), protocol version not supported
    assert_eq!(rj, [0x03, 0, 0, 0, 0, 4, 0, 1, 2, 2]);
    Ok(())
}

#[test]
fn peer_abort_source_is_recorded_during_setup() -> Result<()> {
    let (network, addr) = network(NetworkOptions::new())?;

    let acceptor = spawn_acceptor(&network, |network| {
        let mut params = AssociationParameters::new();
        let mut key = receive_association_request(
            network,
            &mut params,
            Incoming::Accept(BlockMode::Deadline(TIMEOUT)),
        )?;
        abort_association(&mut key)?;
        Ok(())
    });

    let mut params = requestor_params(addr)?;
    let err = request_association(&network, &mut params).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PeerAbortedAssociation);
    assert_eq!(params.abort_source, Some(AbortRQSource::ServiceUser));

    acceptor.join().map_err(|_| "acceptor panicked")??;
    Ok(())
}

#[cfg(feature = "sync-tls")]
mod tls {
    use super::*;
    use dicom_ul_engine::TlsTransportLayer;
    use rcgen::{CertificateParams, KeyPair};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};

    fn tls_layer() -> Result<TlsTransportLayer> {
        let key_pair = KeyPair::generate()?;
        let params = CertificateParams::new(vec!["localhost".to_string()])?;
        let cert = params.self_signed(&key_pair)?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)?;
        let mut roots = RootCertStore::empty();
        roots.add(cert.der().clone())?;
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsTransportLayer::new()
            .server_config(server_config)
            .client_config(client_config))
    }

    #[test]
    fn associate_over_tls() -> Result<()> {
        let (network, addr) = network(NetworkOptions::new().transport_layer(tls_layer()?))?;

        let acceptor = spawn_acceptor(&network, |network| {
            let (mut key, _params) = accept(network)?;
            let pdv = read_next_pdv(&mut key, BlockMode::Deadline(TIMEOUT))?;
            assert_eq!(&pdv.data[..], b"echo");
            let err = read_pdvs(&mut key, BlockMode::Deadline(TIMEOUT)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PeerRequestedRelease);
            acknowledge_release(&mut key)?;
            Ok(())
        });

        let mut params = requestor_params(addr)?;
        let mut key = request_association(&network, &mut params)?;
        write_pdvs(&mut key, &[Pdv::command(1, &b"echo"[..])])?;
        release_association(&mut key)?;
        assert_eq!(key.state(), State::Sta1);

        acceptor.join().map_err(|_| "acceptor panicked")??;
        Ok(())
    }
}
