use dicom_ul_engine::fsm::{transition, Action, Event, State};
use rstest::rstest;

const PDU_EVENTS: [Event; 8] = [
    Event::AssociateAcReceived,
    Event::AssociateRjReceived,
    Event::AssociateRqReceived,
    Event::DataReceived,
    Event::ReleaseRqReceived,
    Event::ReleaseRpReceived,
    Event::AbortReceived,
    Event::InvalidPdu,
];

#[rstest]
#[case(Event::AssociateRequest, State::Sta1, Action::Ae1, Some(State::Sta4))]
#[case(Event::ConnectionConfirm, State::Sta4, Action::Ae2, Some(State::Sta5))]
#[case(Event::AssociateAcReceived, State::Sta5, Action::Ae3, Some(State::Sta6))]
#[case(Event::AssociateRjReceived, State::Sta5, Action::Ae4, Some(State::Sta1))]
#[case(Event::ConnectionIndication, State::Sta1, Action::Ae5, Some(State::Sta2))]
#[case(Event::AssociateRqReceived, State::Sta2, Action::Ae6, None)]
#[case(Event::AssociateAccept, State::Sta3, Action::Ae7, Some(State::Sta6))]
#[case(Event::AssociateReject, State::Sta3, Action::Ae8, Some(State::Sta13))]
#[case(Event::DataRequest, State::Sta6, Action::Dt1, Some(State::Sta6))]
#[case(Event::DataReceived, State::Sta6, Action::Dt2, Some(State::Sta6))]
#[case(Event::ReleaseRequest, State::Sta6, Action::Ar1, Some(State::Sta7))]
#[case(Event::ReleaseRqReceived, State::Sta6, Action::Ar2, Some(State::Sta8))]
#[case(Event::ReleaseRpReceived, State::Sta7, Action::Ar3, Some(State::Sta1))]
#[case(Event::ReleaseResponse, State::Sta8, Action::Ar4, Some(State::Sta13))]
#[case(Event::ConnectionClosed, State::Sta13, Action::Ar5, Some(State::Sta1))]
#[case(Event::DataReceived, State::Sta7, Action::Ar6, Some(State::Sta7))]
#[case(Event::DataRequest, State::Sta8, Action::Ar7, Some(State::Sta8))]
#[case(Event::ReleaseRqReceived, State::Sta7, Action::Ar8, None)]
#[case(Event::ReleaseResponse, State::Sta9, Action::Ar9, Some(State::Sta11))]
#[case(Event::ReleaseRpReceived, State::Sta10, Action::Ar10, Some(State::Sta12))]
#[case(Event::ReleaseRpReceived, State::Sta11, Action::Ar3, Some(State::Sta1))]
#[case(Event::ReleaseResponse, State::Sta12, Action::Ar4, Some(State::Sta13))]
#[case(Event::AbortRequest, State::Sta6, Action::Aa1, Some(State::Sta13))]
#[case(Event::AbortRequest, State::Sta4, Action::Aa2, Some(State::Sta1))]
#[case(Event::ArtimExpired, State::Sta2, Action::Aa2, Some(State::Sta1))]
#[case(Event::ArtimExpired, State::Sta13, Action::Aa2, Some(State::Sta1))]
#[case(Event::ArtimExpired, State::Sta7, Action::Aa2T, Some(State::Sta1))]
#[case(Event::AbortReceived, State::Sta6, Action::Aa3, Some(State::Sta1))]
#[case(Event::AbortReceived, State::Sta13, Action::Aa2, Some(State::Sta1))]
#[case(Event::ConnectionClosed, State::Sta6, Action::Aa4, Some(State::Sta1))]
#[case(Event::ConnectionClosed, State::Sta2, Action::Aa5, Some(State::Sta1))]
#[case(Event::DataReceived, State::Sta13, Action::Aa6, Some(State::Sta13))]
#[case(Event::AssociateRqReceived, State::Sta13, Action::Aa7, Some(State::Sta13))]
#[case(Event::InvalidPdu, State::Sta13, Action::Aa7, Some(State::Sta13))]
#[case(Event::AssociateRqReceived, State::Sta5, Action::Aa8, Some(State::Sta13))]
#[case(Event::DataReceived, State::Sta2, Action::Aa1, Some(State::Sta13))]
#[case(Event::InvalidPdu, State::Sta6, Action::Aa8, Some(State::Sta13))]
fn table_entries(
    #[case] event: Event,
    #[case] state: State,
    #[case] action: Action,
    #[case] next: Option<State>,
) {
    let entry = transition(event, state).expect("event should be admissible");
    assert_eq!(entry.action, action);
    assert_eq!(entry.next, next);
}

#[rstest]
#[case(Event::DataRequest, State::Sta1)]
#[case(Event::DataRequest, State::Sta7)]
#[case(Event::ReleaseRequest, State::Sta7)]
#[case(Event::AssociateRequest, State::Sta6)]
#[case(Event::AssociateAccept, State::Sta2)]
#[case(Event::AbortRequest, State::Sta1)]
#[case(Event::AbortRequest, State::Sta13)]
#[case(Event::ConnectionClosed, State::Sta1)]
#[case(Event::ArtimExpired, State::Sta6)]
#[case(Event::DataReceived, State::Sta4)]
fn inadmissible_events(#[case] event: Event, #[case] state: State) {
    assert_eq!(transition(event, state), None);
}

#[test]
fn table_is_total_over_its_domain() {
    let mut admissible = 0;
    for &event in Event::ALL.iter() {
        for &state in State::ALL.iter() {
            if let Some(entry) = transition(event, state) {
                admissible += 1;
                let decided = matches!(entry.action, Action::Ae6 | Action::Ar8);
                assert_eq!(
                    entry.next.is_none(),
                    decided,
                    "{:?} in {}",
                    event,
                    state
                );
            }
        }
    }
    // 19 events by 13 states, less the cells left empty in PS3.8
    assert!(admissible > 100, "only {} admissible cells", admissible);
}

#[test]
fn idle_state_only_opens_connections() {
    for &event in Event::ALL.iter() {
        let admissible = transition(event, State::Sta1).is_some();
        let expected = matches!(
            event,
            Event::AssociateRequest | Event::ConnectionIndication
        );
        assert_eq!(admissible, expected, "{:?}", event);
    }
}

#[test]
fn every_pdu_is_handled_while_connected() {
    for &state in State::ALL.iter() {
        if matches!(state, State::Sta1 | State::Sta4) {
            continue;
        }
        for &event in PDU_EVENTS.iter() {
            assert!(
                transition(event, state).is_some(),
                "{:?} in {}",
                event,
                state
            );
        }
        assert!(transition(Event::ConnectionClosed, state).is_some());
    }
}

#[test]
fn unexpected_pdus_abort_with_provider_abort() {
    for &state in State::ALL.iter() {
        for &event in PDU_EVENTS.iter() {
            if let Some(entry) = transition(event, state) {
                if entry.action == Action::Aa8 {
                    assert_eq!(entry.next, Some(State::Sta13));
                }
            }
        }
    }
}

#[test]
fn pdus_are_ignored_while_closing() {
    for &event in PDU_EVENTS.iter() {
        let entry = transition(event, State::Sta13).expect("admissible in Sta13");
        assert!(
            matches!(entry.action, Action::Aa6 | Action::Aa7 | Action::Aa2),
            "{:?}",
            event
        );
    }
}
