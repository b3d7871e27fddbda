//! End-to-end driver tests against the scripted fake coprocessor.
//!
//! Each test boots a [`FakeCdsp`], loads programs built with
//! [`ProgramBuilder`] and drives the public surface the way the upper codec
//! driver does:
//!
//! ```text
//! initialize → apply_configuration / load_program → start
//!     → (fake raises flags) → handle_interrupt → callbacks
//! ```

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    use crate::driver::{Cdsp, StatusKind};
    use crate::error::CdspError;
    use crate::event::{EventInfo, EventKind, FatalCode, IrqSources, PipelineIrq};
    use crate::fifo::{FifoKind, FifoRoute};
    use crate::firmware::blob::build;
    use crate::firmware::program::ProgramBuilder;
    use crate::pipeline::{
        ChannelConfig, Connection, InputSource, OutputDestination, PipelineId, PipelineState,
        RateCode,
    };
    use crate::regs;
    use crate::transport::fake::FakeCdsp;

    const DECODE: PipelineId = PipelineId::Decode;
    const ENCODE: PipelineId = PipelineId::Encode;

    const OS_IMAGE: [u8; 10] = [2, 0, 1, 0, 0xA0, 0xA1, 0xA2, 0xA3, 0xD0, 0xD1];

    // Command ids as they appear on the wire.
    const SET_PROGRAM_INFO: u8 = 0x01;
    const SET_CONNECTION: u8 = 0x02;
    const SET_FORMAT: u8 = 0x03;
    const STANDBY: u8 = 0x04;
    const RESET: u8 = 0x05;
    const TERMINATE: u8 = 0x06;
    const INPUT_DATA_END: u8 = 0x07;
    const CLEAR_INPUT_DATA_END: u8 = 0x08;
    const VERIFY_STOP: u8 = 0x09;

    type EventLog = Rc<RefCell<Vec<(PipelineId, EventKind, EventInfo)>>>;

    fn booted() -> Cdsp<FakeCdsp> {
        let mut cdsp = Cdsp::new(FakeCdsp::new());
        cdsp.initialize(&OS_IMAGE).unwrap();
        cdsp
    }

    fn loaded(ids: &[PipelineId]) -> Cdsp<FakeCdsp> {
        let mut cdsp = booted();
        for &id in ids {
            cdsp.load_program(id, &ProgramBuilder::new(id).build()).unwrap();
        }
        cdsp
    }

    fn connect(cdsp: &mut Cdsp<FakeCdsp>, id: PipelineId, input: InputSource, output: OutputDestination) {
        cdsp.configure_connection(id, Connection::new(input, output), ChannelConfig::default())
            .unwrap();
    }

    /// Decode loaded, wired input FIFO → output FIFO and Playing.
    fn playing_decode() -> Cdsp<FakeCdsp> {
        let mut cdsp = loaded(&[DECODE]);
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        cdsp.start(DECODE).unwrap();
        cdsp
    }

    fn record_events(cdsp: &mut Cdsp<FakeCdsp>) -> EventLog {
        let log: EventLog = Rc::new(RefCell::new(Vec::new()));
        for id in PipelineId::ALL {
            let sink = log.clone();
            cdsp.register_callback(
                id,
                Box::new(move |id, kind, info| sink.borrow_mut().push((id, kind, info))),
            );
        }
        log
    }

    fn kinds(log: &EventLog) -> Vec<(PipelineId, EventKind)> {
        log.borrow().iter().map(|&(id, kind, _)| (id, kind)).collect()
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    #[test]
    fn single_pipeline_to_playing() {
        let mut cdsp = loaded(&[DECODE]);
        assert_eq!(cdsp.state(DECODE), PipelineState::ReadySetup);
        assert_eq!(cdsp.transport().mem_bytes, 6 + 12);

        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        assert_eq!(cdsp.fifo_config().channel_bits, 0x11);

        cdsp.start(DECODE).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::Playing);
        assert_eq!(
            cdsp.transport().command_ids(DECODE),
            vec![SET_PROGRAM_INFO, SET_CONNECTION, STANDBY]
        );
        // Immediate output start: the output FIFO runs with the pipeline.
        assert_eq!(cdsp.transport().reg(regs::FIFO_START), 0x04);

        cdsp.transport_mut().set_positions(DECODE, 0, 48_001);
        assert_eq!(cdsp.query_status(StatusKind::OutputPosition(DECODE)).unwrap(), 1001);
    }

    #[test]
    fn reloading_the_resident_program_is_a_no_op() {
        let mut cdsp = loaded(&[DECODE]);
        let bytes = cdsp.transport().mem_bytes;
        cdsp.transport_mut().clear_logs();

        cdsp.load_program(DECODE, &ProgramBuilder::new(DECODE).build()).unwrap();
        assert!(cdsp.transport().commands.is_empty());
        assert_eq!(cdsp.transport().mem_bytes, bytes);
        assert_eq!(cdsp.state(DECODE), PipelineState::ReadySetup);
    }

    #[test]
    fn different_program_replaces_the_resident_one() {
        let mut cdsp = loaded(&[DECODE]);
        cdsp.transport_mut().clear_logs();

        let mut other = ProgramBuilder::new(DECODE);
        other.function_id = 7;
        cdsp.load_program(DECODE, &other.build()).unwrap();
        assert_eq!(cdsp.transport().command_ids(DECODE), vec![RESET, SET_PROGRAM_INFO]);
        assert_eq!(cdsp.identity(DECODE).unwrap().function_id, 7);
    }

    #[test]
    fn overlapping_program_memory_is_rejected() {
        let mut cdsp = loaded(&[DECODE]);
        cdsp.transport_mut().clear_logs();

        let mut clash = ProgramBuilder::new(ENCODE);
        clash.layout = ProgramBuilder::new(DECODE).layout;
        assert!(matches!(
            cdsp.load_program(ENCODE, &clash.build()),
            Err(CdspError::ResourceOverlap(_))
        ));
        assert_eq!(cdsp.state(ENCODE), PipelineState::Init);
        assert!(cdsp.transport().commands.is_empty());
    }

    #[test]
    fn failed_load_unwinds_to_init() {
        let mut cdsp = booted();
        cdsp.transport_mut().set_result(SET_PROGRAM_INFO, 0xF2);

        assert!(matches!(
            cdsp.load_program(DECODE, &ProgramBuilder::new(DECODE).build()),
            Err(CdspError::State(_))
        ));
        assert_eq!(cdsp.state(DECODE), PipelineState::Init);
        assert!(cdsp.identity(DECODE).is_none());
        assert_eq!(cdsp.transport().command_ids(DECODE), vec![SET_PROGRAM_INFO, TERMINATE]);
    }

    #[test]
    fn start_and_stop_state_rules() {
        let mut cdsp = loaded(&[DECODE]);
        assert!(matches!(cdsp.start(ENCODE), Err(CdspError::State(_))));
        assert!(matches!(cdsp.stop(DECODE), Err(CdspError::State(_))));

        cdsp.start(DECODE).unwrap();
        cdsp.stop(DECODE).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::Ready);

        // Stopping a Ready pipeline does nothing.
        cdsp.transport_mut().clear_logs();
        cdsp.stop(DECODE).unwrap();
        assert!(cdsp.transport().commands.is_empty());
    }

    #[test]
    fn stop_disarms_the_output_fifo() {
        let mut cdsp = playing_decode();
        cdsp.stop(DECODE).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::Ready);
        assert_eq!(cdsp.transport().reg(regs::FIFO_START), 0);
        assert_eq!(cdsp.transport().reg(regs::OFIFO_ENABLE), 0);
        assert!(!cdsp.fifo_config().output_start_armed);
        assert_eq!(*cdsp.transport().command_ids(DECODE).last().unwrap(), VERIFY_STOP);
    }

    #[test]
    fn stop_verification_timeout_is_tolerated() {
        let mut cdsp = playing_decode();
        cdsp.transport_mut().hang(VERIFY_STOP);
        cdsp.stop(DECODE).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::Ready);
    }

    #[test]
    fn stop_completes_when_verification_is_rejected() {
        let mut cdsp = playing_decode();
        cdsp.transport_mut().set_result(VERIFY_STOP, 0xF2);
        cdsp.stop(DECODE).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::Ready);
        assert_eq!(cdsp.transport().reg(regs::FIFO_START), 0);
        assert_eq!(cdsp.transport().reg(DECODE.regs().ctl()) & regs::CTL_START, 0);
        assert_eq!(
            cdsp.transport().reg(DECODE.regs().irq_enable()),
            PipelineIrq::SFR.bits()
        );

        // The pipeline can be started again.
        cdsp.start(DECODE).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::Playing);
    }

    #[test]
    fn oversized_trigger_point_fails_before_setup() {
        let mut cdsp = loaded(&[DECODE]);
        let mut payload = build::fifo_payload(
            Connection::new(InputSource::InputFifo, OutputDestination::OutputFifo),
            ChannelConfig::default(),
        );
        payload[14..18].copy_from_slice(&0x8000u32.to_le_bytes());
        let mut blob = Vec::new();
        build::fifo(&mut blob, DECODE, &payload);
        cdsp.apply_configuration(&blob).unwrap();

        // Widening the output turns the same depth into an unreachable point.
        cdsp.configure_connection(
            DECODE,
            Connection::new(InputSource::InputFifo, OutputDestination::OutputFifo),
            ChannelConfig::new(2, 16, 6, 32),
        )
        .unwrap();
        cdsp.transport_mut().clear_logs();

        assert!(matches!(cdsp.start(DECODE), Err(CdspError::Argument(_))));
        assert_eq!(cdsp.state(DECODE), PipelineState::ReadySetup);
        assert!(cdsp.transport().commands.is_empty());
    }

    #[test]
    fn coupled_start_needs_a_configured_sibling() {
        let mut cdsp = loaded(&[DECODE]);
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OtherPipelineInput);
        assert!(matches!(cdsp.start(DECODE), Err(CdspError::State(_))));
        assert_eq!(cdsp.state(DECODE), PipelineState::ReadySetup);
    }

    #[test]
    fn sample_rate_change_resets_a_ready_pipeline() {
        let mut cdsp = loaded(&[DECODE]);
        cdsp.start(DECODE).unwrap();
        cdsp.stop(DECODE).unwrap();
        cdsp.transport_mut().clear_logs();

        cdsp.set_sample_rate(DECODE, 1).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::ReadySetup);
        assert_eq!(cdsp.format(DECODE).rate, RateCode::Hz44100);
        assert_eq!(cdsp.transport().command_ids(DECODE), vec![RESET, SET_FORMAT]);

        assert!(matches!(cdsp.set_sample_rate(DECODE, 10), Err(CdspError::Argument(_))));
        cdsp.start(DECODE).unwrap();
        assert!(matches!(cdsp.set_sample_rate(DECODE, 0), Err(CdspError::State(_))));
    }

    #[test]
    fn terminate_pipeline_returns_to_init() {
        let mut cdsp = playing_decode();
        cdsp.transport_mut().clear_logs();

        cdsp.terminate_pipeline(DECODE).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::Init);
        assert!(cdsp.identity(DECODE).is_none());
        assert_eq!(cdsp.connection(DECODE), Connection::default());
        assert_eq!(
            cdsp.transport().command_ids(DECODE),
            vec![VERIFY_STOP, RESET, TERMINATE]
        );
        assert_eq!(cdsp.transport().fifo_resets, vec![0x05]);
        assert_eq!(cdsp.fifo_config().channel_bits, 0);
    }

    // ---------------------------------------------------------------
    // Connections
    // ---------------------------------------------------------------

    #[test]
    fn only_changed_fifos_are_reset() {
        let mut cdsp = loaded(&[DECODE]);
        cdsp.transport_mut().clear_logs();
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        assert_eq!(cdsp.transport().fifo_resets, vec![0x05]);

        cdsp.transport_mut().clear_logs();
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::RecordFifo);
        assert_eq!(cdsp.transport().fifo_resets, vec![0x0C]);
        // The dropped output FIFO loses its channel field.
        assert_eq!(cdsp.fifo_config().channel_bits, 0x41);
    }

    #[test]
    fn sibling_fifo_claims_collide() {
        let mut cdsp = loaded(&[DECODE, ENCODE]);
        connect(&mut cdsp, ENCODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        cdsp.transport_mut().clear_logs();

        let result = cdsp.configure_connection(
            DECODE,
            Connection::new(InputSource::ExternalFifo, OutputDestination::OutputFifo),
            ChannelConfig::default(),
        );
        assert!(matches!(result, Err(CdspError::ResourceOverlap(_))));
        assert!(cdsp.transport().commands.is_empty());
        assert_eq!(cdsp.connection(DECODE), Connection::default());
    }

    #[test]
    fn bad_channel_layout_is_rejected() {
        let mut cdsp = loaded(&[DECODE]);
        let result = cdsp.configure_connection(
            DECODE,
            Connection::new(InputSource::InputFifo, OutputDestination::OutputFifo),
            ChannelConfig::new(3, 16, 2, 16),
        );
        assert!(matches!(result, Err(CdspError::Argument(_))));
    }

    // ---------------------------------------------------------------
    // Configuration blobs
    // ---------------------------------------------------------------

    #[test]
    fn blob_loads_routes_and_parameterises() {
        let mut cdsp = booted();
        let mut blob = Vec::new();
        build::program(&mut blob, DECODE, &ProgramBuilder::new(DECODE).build());
        build::fifo(
            &mut blob,
            DECODE,
            &build::fifo_payload(
                Connection::new(InputSource::InputFifo, OutputDestination::OutputFifo),
                ChannelConfig::default(),
            ),
        );
        build::params(&mut blob, DECODE, &[(0x20, [0xAB; 16])]);

        cdsp.check_configuration(&blob).unwrap();
        assert!(cdsp.transport().commands.is_empty());

        cdsp.apply_configuration(&blob).unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::ReadySetup);
        assert_eq!(
            cdsp.transport().command_ids(DECODE),
            vec![SET_PROGRAM_INFO, SET_CONNECTION, 0x20]
        );
        assert_eq!(cdsp.transport().commands[2].args, [0xAB; 16]);
        assert_eq!(
            cdsp.connection(DECODE),
            Connection::new(InputSource::InputFifo, OutputDestination::OutputFifo)
        );
    }

    #[test]
    fn duplicate_program_chunk_changes_nothing() {
        let mut cdsp = booted();
        let descriptor = ProgramBuilder::new(DECODE).build();
        let mut blob = Vec::new();
        build::program(&mut blob, DECODE, &descriptor);
        build::program(&mut blob, DECODE, &descriptor);
        let bytes = cdsp.transport().mem_bytes;

        assert!(matches!(cdsp.apply_configuration(&blob), Err(CdspError::Argument(_))));
        assert_eq!(cdsp.state(DECODE), PipelineState::Init);
        assert!(cdsp.transport().commands.is_empty());
        assert_eq!(cdsp.transport().mem_bytes, bytes);
    }

    #[test]
    fn blob_with_colliding_claims_applies_nothing() {
        let mut cdsp = booted();
        let io = build::fifo_payload(
            Connection::new(InputSource::InputFifo, OutputDestination::OutputFifo),
            ChannelConfig::default(),
        );
        let mut blob = Vec::new();
        for id in PipelineId::ALL {
            build::program(&mut blob, id, &ProgramBuilder::new(id).build());
            build::fifo(&mut blob, id, &io);
        }

        assert!(matches!(cdsp.check_configuration(&blob), Err(CdspError::ResourceOverlap(_))));
        assert!(matches!(cdsp.apply_configuration(&blob), Err(CdspError::ResourceOverlap(_))));
        assert!(cdsp.transport().commands.is_empty());
        assert_eq!(cdsp.state(DECODE), PipelineState::Init);
    }

    #[test]
    fn routing_chunk_needs_a_program() {
        let cdsp = booted();
        let mut blob = Vec::new();
        build::fifo(
            &mut blob,
            ENCODE,
            &build::fifo_payload(
                Connection::new(InputSource::ExternalFifo, OutputDestination::RecordFifo),
                ChannelConfig::default(),
            ),
        );
        assert!(matches!(cdsp.check_configuration(&blob), Err(CdspError::State(_))));
    }

    #[test]
    fn blob_before_initialize_is_a_state_error() {
        let cdsp = Cdsp::new(FakeCdsp::new());
        let mut blob = Vec::new();
        build::program(&mut blob, DECODE, &ProgramBuilder::new(DECODE).build());
        assert!(matches!(cdsp.check_configuration(&blob), Err(CdspError::State(_))));
    }

    #[test]
    fn unreachable_fifo_depth_is_rejected_up_front() {
        let mut cdsp = booted();
        let mut payload = build::fifo_payload(
            Connection::new(InputSource::InputFifo, OutputDestination::OutputFifo),
            ChannelConfig::default(),
        );
        payload[14..18].copy_from_slice(&0x20000u32.to_le_bytes());
        let mut blob = Vec::new();
        build::program(&mut blob, DECODE, &ProgramBuilder::new(DECODE).build());
        build::fifo(&mut blob, DECODE, &payload);

        assert!(matches!(cdsp.check_configuration(&blob), Err(CdspError::Argument(_))));
        assert!(matches!(cdsp.apply_configuration(&blob), Err(CdspError::Argument(_))));
        assert_eq!(cdsp.state(DECODE), PipelineState::Init);
        assert!(cdsp.transport().commands.is_empty());
    }

    #[test]
    fn extension_cannot_retarget_a_playing_external_fifo() {
        let mut cdsp = loaded(&[DECODE, ENCODE]);
        connect(&mut cdsp, DECODE, InputSource::ExternalFifo, OutputDestination::OutputFifo);
        cdsp.start(DECODE).unwrap();
        let sink0 = cdsp.transport().reg(regs::EFIFO_SINK0);
        cdsp.transport_mut().clear_logs();

        let mut blob = Vec::new();
        build::extension(&mut blob, ENCODE, [7, 9, 0xFF, 0xFF, 0]);
        assert!(matches!(cdsp.check_configuration(&blob), Err(CdspError::State(_))));
        assert!(matches!(cdsp.apply_configuration(&blob), Err(CdspError::State(_))));
        assert_eq!(cdsp.fifo_config().efifo_sink, [0, 0]);
        assert_eq!(cdsp.transport().reg(regs::EFIFO_SINK0), sink0);
        assert!(cdsp.transport().commands.is_empty());
    }

    #[test]
    fn shared_selector_is_locked_by_a_playing_sibling() {
        let mut cdsp = loaded(&[DECODE, ENCODE]);
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        cdsp.start(DECODE).unwrap();
        let selector = cdsp.fifo_config().input_record_sel;
        cdsp.transport_mut().clear_logs();

        let mut payload = build::fifo_payload(
            Connection::new(InputSource::ExternalFifo, OutputDestination::RecordFifo),
            ChannelConfig::default(),
        );
        payload[25] = 0x03;
        let mut blob = Vec::new();
        build::fifo(&mut blob, ENCODE, &payload);

        assert!(matches!(cdsp.apply_configuration(&blob), Err(CdspError::State(_))));
        assert_eq!(cdsp.fifo_config().input_record_sel, selector);
        assert_eq!(cdsp.connection(ENCODE), Connection::default());
        assert!(cdsp.transport().commands.is_empty());
    }

    #[test]
    fn extension_chunk_sets_format_and_timer() {
        let mut cdsp = booted();
        let mut blob = Vec::new();
        build::program(&mut blob, DECODE, &ProgramBuilder::new(DECODE).build());
        build::extension(&mut blob, DECODE, [0x03, 0x01, 1, 0xFF, 0x01]);
        cdsp.apply_configuration(&blob).unwrap();

        assert_eq!(cdsp.format(DECODE).rate, RateCode::Hz44100);
        assert_eq!(cdsp.fifo_config().efifo_sink, [0x03, 0x01]);
        assert_eq!(cdsp.transport().reg(regs::EFIFO_SINK0), 0x03);
        assert_eq!(*cdsp.transport().command_ids(DECODE).last().unwrap(), SET_FORMAT);

        let log = record_events(&mut cdsp);
        cdsp.start(DECODE).unwrap();
        let enable = cdsp.transport().reg(DECODE.regs().irq_enable());
        assert_ne!(enable & PipelineIrq::EVENT.bits(), 0);

        cdsp.transport_mut().raise_pipeline(DECODE, PipelineIrq::EVENT);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(kinds(&log), vec![(DECODE, EventKind::Timer)]);
    }

    // ---------------------------------------------------------------
    // Parameters
    // ---------------------------------------------------------------

    #[test]
    fn parameter_pass_through() {
        let mut cdsp = loaded(&[DECODE]);
        cdsp.set_parameter(DECODE, 0x20, &[1, 2, 3]).unwrap();
        let pending = cdsp.get_parameter(DECODE);
        assert_eq!(pending.id, 0x20);
        assert_eq!(&pending.args[..4], &[1, 2, 3, 0]);

        assert!(matches!(cdsp.set_parameter(DECODE, 0x05, &[]), Err(CdspError::Argument(_))));
        assert!(matches!(cdsp.set_parameter(ENCODE, 0x20, &[]), Err(CdspError::State(_))));
    }

    #[test]
    fn command_timeout_frees_the_mailbox() {
        let mut cdsp = loaded(&[DECODE]);
        cdsp.transport_mut().hang(0x20);
        assert_eq!(cdsp.set_parameter(DECODE, 0x20, &[]), Err(CdspError::Timeout));
        cdsp.set_parameter(DECODE, 0x21, &[]).unwrap();
        assert_eq!(cdsp.get_parameter(DECODE).id, 0x21);
    }

    #[test]
    fn notification_round_trip() {
        let mut cdsp = loaded(&[DECODE]);
        let log = record_events(&mut cdsp);

        cdsp.transport_mut().raise_notification(DECODE, 0x30, &[7; 16]);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(kinds(&log), vec![(DECODE, EventKind::HostCommand)]);
        assert_eq!(log.borrow()[0].2, EventInfo::default());
        let pending = cdsp.get_parameter(DECODE);
        assert_eq!(pending.id, 0x30);
        assert_eq!(pending.args, [7; 16]);

        cdsp.set_parameter(DECODE, 0x30 | regs::CMD_COMPLETION, &[9, 9]).unwrap();
        let ack = cdsp.transport().acks[0];
        assert_eq!((ack.pipeline, ack.id), (DECODE, 0x30));
        assert_eq!(&ack.args[..2], &[9, 9]);
        assert_eq!(&cdsp.get_parameter(DECODE).results[..3], &[9, 9, 0]);
    }

    // ---------------------------------------------------------------
    // End of input
    // ---------------------------------------------------------------

    #[test]
    fn input_data_end_is_held_until_start() {
        let mut cdsp = loaded(&[DECODE]);
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        cdsp.transport_mut().clear_logs();

        cdsp.set_input_data_end(DECODE).unwrap();
        assert!(cdsp.transport().commands.is_empty());

        cdsp.start(DECODE).unwrap();
        assert_eq!(cdsp.transport().command_ids(DECODE), vec![STANDBY, INPUT_DATA_END]);
        assert!(matches!(cdsp.set_input_data_end(ENCODE), Err(CdspError::State(_))));
    }

    #[test]
    fn end_of_data_stops_and_reports() {
        let mut cdsp = playing_decode();
        let log = record_events(&mut cdsp);
        cdsp.set_input_data_end(DECODE).unwrap();
        cdsp.transport_mut().clear_logs();

        cdsp.transport_mut().raise_pipeline(DECODE, PipelineIrq::END);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(cdsp.state(DECODE), PipelineState::Ready);
        assert_eq!(
            cdsp.transport().command_ids(DECODE),
            vec![CLEAR_INPUT_DATA_END, VERIFY_STOP]
        );
        assert_eq!(kinds(&log), vec![(DECODE, EventKind::EndOfSequence)]);
        assert_eq!(cdsp.transport().reg(regs::IRQ_FLAG), 0);
    }

    #[test]
    fn clear_input_data_end_withdraws_the_request() {
        let mut cdsp = loaded(&[DECODE]);
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        cdsp.transport_mut().clear_logs();

        // Held request withdrawn before start: nothing reaches the program.
        cdsp.set_input_data_end(DECODE).unwrap();
        cdsp.clear_input_data_end(DECODE).unwrap();
        cdsp.start(DECODE).unwrap();
        assert_eq!(cdsp.transport().command_ids(DECODE), vec![STANDBY]);

        cdsp.set_input_data_end(DECODE).unwrap();
        cdsp.clear_input_data_end(DECODE).unwrap();
        // Cleared, so a new request is sent again.
        cdsp.set_input_data_end(DECODE).unwrap();
        assert_eq!(
            cdsp.transport().command_ids(DECODE),
            vec![STANDBY, INPUT_DATA_END, CLEAR_INPUT_DATA_END, INPUT_DATA_END]
        );

        assert!(matches!(cdsp.clear_input_data_end(ENCODE), Err(CdspError::State(_))));
    }

    // ---------------------------------------------------------------
    // Format propagation
    // ---------------------------------------------------------------

    #[test]
    fn coupled_format_change_restarts_downstream() {
        let mut cdsp = loaded(&[DECODE, ENCODE]);
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OtherPipelineInput);
        connect(&mut cdsp, ENCODE, InputSource::OtherPipelineOutput, OutputDestination::OutputFifo);
        cdsp.start(ENCODE).unwrap();
        cdsp.start(DECODE).unwrap();
        let log = record_events(&mut cdsp);
        cdsp.transport_mut().clear_logs();

        // Upstream announces 44.1 kHz; downstream is told to drain.
        cdsp.transport_mut().raise_notification(DECODE, 0x11, &[1, 0, 0, 0]);
        cdsp.handle_interrupt().unwrap();
        assert!(cdsp.transport().acks.is_empty());
        assert_eq!(cdsp.transport().command_ids(ENCODE), vec![INPUT_DATA_END]);
        assert_eq!(cdsp.state(ENCODE), PipelineState::Playing);

        // Downstream drained: it restarts in the new format.
        cdsp.transport_mut().set_positions(ENCODE, 48_000, 0);
        cdsp.transport_mut().raise_pipeline(ENCODE, PipelineIrq::END);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(cdsp.state(ENCODE), PipelineState::Playing);
        assert_eq!(cdsp.format(ENCODE).rate, RateCode::Hz44100);
        assert_eq!(
            cdsp.transport().command_ids(ENCODE),
            vec![INPUT_DATA_END, VERIFY_STOP, RESET, SET_FORMAT, STANDBY]
        );
        let ack = cdsp.transport().acks[0];
        assert_eq!((ack.pipeline, ack.id), (DECODE, 0x11));
        assert!(log.borrow().is_empty());

        // Position keeps counting across the restart.
        cdsp.transport_mut().set_positions(ENCODE, 0, 0);
        assert_eq!(cdsp.query_status(StatusKind::InputPosition(ENCODE)).unwrap(), 1000);
    }

    #[test]
    fn format_change_applies_at_once_to_a_stopped_sibling() {
        let mut cdsp = loaded(&[DECODE, ENCODE]);
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OtherPipelineInput);
        connect(&mut cdsp, ENCODE, InputSource::OtherPipelineOutput, OutputDestination::OutputFifo);
        cdsp.transport_mut().clear_logs();

        cdsp.transport_mut().raise_notification(DECODE, 0x11, &[2, 3, 0, 0]);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(cdsp.format(ENCODE).rate, RateCode::Hz32000);
        assert_eq!(cdsp.transport().command_ids(ENCODE), vec![SET_FORMAT]);
        assert_eq!(cdsp.transport().acks.len(), 1);
    }

    #[test]
    fn host_routed_record_cannot_feed_a_coupled_pipeline() {
        let mut cdsp = loaded(&[DECODE, ENCODE]);
        cdsp.select_fifo_routing(FifoKind::Record, FifoRoute::Host).unwrap();
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OtherPipelineInput);

        let result = cdsp.configure_connection(
            ENCODE,
            Connection::new(InputSource::OtherPipelineOutput, OutputDestination::RecordFifo),
            ChannelConfig::default(),
        );
        assert!(matches!(result, Err(CdspError::Argument(_))));
    }

    // ---------------------------------------------------------------
    // Errors
    // ---------------------------------------------------------------

    #[test]
    fn recoverable_error_leaves_pipeline_ready() {
        let mut cdsp = playing_decode();
        let log = record_events(&mut cdsp);
        cdsp.transport_mut().set_positions(DECODE, 0, 96_000);
        cdsp.transport_mut().raise_error(DECODE, 0x12);
        cdsp.handle_interrupt().unwrap();

        assert_eq!(cdsp.state(DECODE), PipelineState::Ready);
        assert!(cdsp.identity(DECODE).is_some());
        assert_eq!(
            *log.borrow(),
            vec![(DECODE, EventKind::Error1, EventInfo { position: 2000, code: 0x12 })]
        );
        assert_eq!(cdsp.query_status(StatusKind::ErrorCode(DECODE)).unwrap(), 0x12);
    }

    #[test]
    fn recoverable_error_stops_even_when_verification_is_rejected() {
        let mut cdsp = playing_decode();
        let log = record_events(&mut cdsp);
        cdsp.transport_mut().set_result(VERIFY_STOP, 0xF7);
        cdsp.transport_mut().raise_error(DECODE, 0x12);
        cdsp.handle_interrupt().unwrap();

        assert_eq!(cdsp.state(DECODE), PipelineState::Ready);
        assert_eq!(cdsp.transport().reg(regs::FIFO_START), 0);
        assert_eq!(kinds(&log), vec![(DECODE, EventKind::Error1)]);
    }

    #[test]
    fn program_fatal_error_needs_a_new_program() {
        let mut cdsp = playing_decode();
        let log = record_events(&mut cdsp);
        cdsp.transport_mut().raise_error(DECODE, 0x85);
        cdsp.handle_interrupt().unwrap();

        assert_eq!(cdsp.state(DECODE), PipelineState::ReadySetup);
        assert!(cdsp.identity(DECODE).is_none());
        assert_eq!(cdsp.transport().reg(DECODE.regs().irq_enable()), 0);
        assert_eq!(kinds(&log), vec![(DECODE, EventKind::Error2)]);
        assert_eq!(log.borrow()[0].2.code, 0x85);
    }

    #[test]
    fn coprocessor_fatal_resets_everything() {
        let mut cdsp = loaded(&[DECODE, ENCODE]);
        let log = record_events(&mut cdsp);
        cdsp.transport_mut().raise_notification(DECODE, 0x30, &[]);
        cdsp.transport_mut().raise_fatal(2);
        cdsp.handle_interrupt().unwrap();

        for id in PipelineId::ALL {
            assert_eq!(cdsp.state(id), PipelineState::NotInit);
            assert!(cdsp.identity(id).is_none());
        }
        // The notification is masked by the fatal condition.
        assert_eq!(
            *log.borrow(),
            vec![
                (DECODE, EventKind::HwError, EventInfo { position: 0, code: 2 }),
                (ENCODE, EventKind::HwError, EventInfo { position: 0, code: 2 }),
            ]
        );
        assert_eq!(cdsp.hw_error(), FatalCode::Watchdog);
        assert_eq!(cdsp.query_status(StatusKind::FatalCode).unwrap(), 2);
        assert_eq!(cdsp.transport().reg(regs::IRQ_ENABLE), IrqSources::FATAL.bits());

        // Nothing more is serviced until the next initialize.
        cdsp.transport_mut().raise_fatal(2);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(log.borrow().len(), 2);

        cdsp.initialize(&OS_IMAGE).unwrap();
        assert_eq!(cdsp.hw_error(), FatalCode::None);
        assert_eq!(cdsp.state(DECODE), PipelineState::Init);
    }

    #[test]
    fn events_without_a_callback_are_dropped() {
        let mut cdsp = loaded(&[DECODE]);
        cdsp.transport_mut().raise_notification(DECODE, 0x30, &[]);
        cdsp.handle_interrupt().unwrap();

        let log = record_events(&mut cdsp);
        cdsp.handle_interrupt().unwrap();
        assert!(log.borrow().is_empty());
    }

    // ---------------------------------------------------------------
    // FIFO routing and host I/O
    // ---------------------------------------------------------------

    #[test]
    fn output_waits_for_its_trigger_point() {
        let mut cdsp = loaded(&[]);
        let mut program = ProgramBuilder::new(DECODE);
        program.out_start_mode = 1;
        cdsp.load_program(DECODE, &program.build()).unwrap();
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        cdsp.start(DECODE).unwrap();
        assert_eq!(cdsp.transport().reg(regs::FIFO_START), 0);
        assert_eq!(cdsp.transport().reg(regs::OFIFO_ENABLE), 0x01);

        cdsp.transport_mut().raise_fifo(IrqSources::OUTPUT_FIFO, regs::OFIFO_FLAG, 0x01);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(cdsp.transport().reg(regs::FIFO_START), 0x04);
        assert_eq!(cdsp.transport().reg(regs::OFIFO_ENABLE), 0);
    }

    #[test]
    fn only_input_and_record_are_host_routable() {
        let mut cdsp = booted();
        assert!(matches!(
            cdsp.select_fifo_routing(FifoKind::Output, FifoRoute::Host),
            Err(CdspError::Argument(_))
        ));
        cdsp.select_fifo_routing(FifoKind::Record, FifoRoute::Host).unwrap();
        assert_eq!(cdsp.transport().reg(regs::FIFO_HOST_SEL), 0x08);
        assert!(cdsp.fifo_config().is_host_routed(FifoKind::Record));
        cdsp.select_fifo_routing(FifoKind::Record, FifoRoute::Port).unwrap();
        assert_eq!(cdsp.transport().reg(regs::FIFO_HOST_SEL), 0);
    }

    #[test]
    fn routing_is_locked_while_playing() {
        let mut cdsp = playing_decode();
        assert!(matches!(
            cdsp.select_fifo_routing(FifoKind::Input, FifoRoute::Host),
            Err(CdspError::State(_))
        ));
    }

    #[test]
    fn host_writes_fill_the_input_fifo() {
        let mut cdsp = booted();
        assert!(matches!(cdsp.write_bytes(&[1]), Err(CdspError::State(_))));

        cdsp.select_fifo_routing(FifoKind::Input, FifoRoute::Host).unwrap();
        assert_eq!(cdsp.write_bytes(&[1, 2, 3]).unwrap(), 3);
        assert_eq!(cdsp.transport().input_data, vec![1, 2, 3]);
        assert_eq!(cdsp.fifo_config().input_write_size, 3);
        assert_eq!(cdsp.query_status(StatusKind::InputFifoRemaining).unwrap(), 0x1000 - 3);
    }

    #[test]
    fn host_writes_stop_at_capacity() {
        let mut cdsp = booted();
        cdsp.select_fifo_routing(FifoKind::Input, FifoRoute::Host).unwrap();
        cdsp.transport_mut().set_reg(regs::IFIFO_REMAIN_H, 0);
        cdsp.transport_mut().set_reg(regs::IFIFO_REMAIN_L, 2);
        assert_eq!(cdsp.write_bytes(&[1, 2, 3, 4]).unwrap(), 2);
        assert_eq!(cdsp.transport().input_data, vec![1, 2]);
    }

    #[test]
    fn host_reads_drain_the_record_fifo() {
        let mut cdsp = booted();
        let mut buf = [0u8; 4];
        assert!(matches!(cdsp.read_bytes(&mut buf), Err(CdspError::State(_))));

        cdsp.select_fifo_routing(FifoKind::Record, FifoRoute::Host).unwrap();
        cdsp.transport_mut().fill_record(&[5, 6, 7]);
        assert_eq!(cdsp.query_status(StatusKind::RecordFifoRemaining).unwrap(), 3);
        assert_eq!(cdsp.read_bytes(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[5, 6, 7]);
        assert_eq!(cdsp.query_status(StatusKind::RecordFifoRemaining).unwrap(), 0);
    }

    #[test]
    fn host_routed_record_starts_with_the_pipeline() {
        let mut cdsp = loaded(&[DECODE]);
        let log = record_events(&mut cdsp);
        cdsp.select_fifo_routing(FifoKind::Record, FifoRoute::Host).unwrap();
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::RecordFifo);
        cdsp.start(DECODE).unwrap();
        assert_eq!(cdsp.transport().reg(regs::FIFO_START), 0x08);
        assert_eq!(cdsp.transport().reg(regs::RFIFO_ENABLE), 0x02);

        cdsp.transport_mut().raise_fifo(IrqSources::RECORD_FIFO, regs::RFIFO_FLAG, 0x02);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(kinds(&log), vec![(DECODE, EventKind::RecordBufferOverflow)]);
        assert_eq!(cdsp.transport().reg(regs::RFIFO_ENABLE), 0);
    }

    #[test]
    fn input_fifo_events_reach_the_owner() {
        let mut cdsp = loaded(&[DECODE]);
        let log = record_events(&mut cdsp);
        cdsp.select_fifo_routing(FifoKind::Input, FifoRoute::Host).unwrap();
        connect(&mut cdsp, DECODE, InputSource::InputFifo, OutputDestination::OutputFifo);
        cdsp.start(DECODE).unwrap();
        assert_eq!(cdsp.transport().reg(regs::IFIFO_ENABLE), 0x02);

        cdsp.transport_mut().raise_fifo(IrqSources::INPUT_FIFO, regs::IFIFO_FLAG, 0x02);
        cdsp.handle_interrupt().unwrap();
        assert_eq!(kinds(&log), vec![(DECODE, EventKind::FifoEmpty)]);
        assert_eq!(cdsp.transport().reg(regs::IFIFO_ENABLE), 0);

        // Writing more data re-arms the empty interrupt.
        cdsp.write_bytes(&[0; 8]).unwrap();
        assert_eq!(cdsp.transport().reg(regs::IFIFO_ENABLE), 0x02);
    }
}
