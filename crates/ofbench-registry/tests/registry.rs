use bytes::Bytes;
use ofbench_core::{
    dispatch_message, ChannelId, ExecutionContext, HandlerResult, MessageKind, PacketEvent,
    TestModule, TimerEvent, TimerId,
};
use ofbench_registry::{
    Catalog, DylibLoader, LoadError, ModuleLoader, ModuleRegistry, ModuleSymbols,
};
use ofbench_testkit::{decode_all, message};

fn minimal_name() -> &'static str {
    "minimal"
}

fn minimal_start(ctx: &mut ExecutionContext) -> HandlerResult {
    ctx.end_test();
    Ok(())
}

fn minimal_symbols() -> ModuleSymbols {
    ModuleSymbols {
        name: Some(minimal_name),
        start: Some(minimal_start),
        ..ModuleSymbols::default()
    }
}

fn catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog
        .register_symbols("minimal", minimal_symbols())
        .register_symbols(
            "nameless",
            ModuleSymbols {
                start: Some(minimal_start),
                ..ModuleSymbols::default()
            },
        );
    catalog
}

#[test]
fn name_and_start_are_enough() {
    let mut registry = ModuleRegistry::new();
    let handle = registry.load(&catalog(), "minimal", "").unwrap();
    let mut module = registry.checkout(handle).unwrap();
    let mut ctx = ExecutionContext::default();

    assert_eq!(module.name(), "minimal");
    module.init(&mut ctx, "ignored args").unwrap();
    assert_eq!(module.get_pcap_filter(&ctx, ChannelId(1)), "");
    module
        .handle_pcap_event(&mut ctx, &PacketEvent::now(Bytes::from_static(b"pkt")), ChannelId(1))
        .unwrap();
    module
        .handle_timer_event(
            &mut ctx,
            &TimerEvent {
                due: tokio::time::Instant::now(),
                id: TimerId(0),
                kind: 1,
                arg: 2,
            },
        )
        .unwrap();
    module.start(&mut ctx).unwrap();
    assert!(ctx.should_end());
}

#[test]
fn every_known_kind_dispatches_into_a_default() {
    let mut module = catalog().load("minimal").unwrap().module;
    let mut ctx = ExecutionContext::default();

    for kind in (0..=u8::MAX).filter_map(MessageKind::from_u8) {
        let bytes = message(kind, u32::from(kind.as_u8()), b"payload");
        let msg = decode_all(&bytes).unwrap().remove(0);
        dispatch_message(module.as_mut(), &mut ctx, &msg).unwrap();
    }

    // Only the echo request produced an answer.
    let mut replies = Vec::new();
    while let Some(bytes) = ctx.take_outbound() {
        replies.extend(decode_all(&bytes).unwrap());
    }
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind(), Some(MessageKind::EchoReply));
    assert_eq!(replies[0].xid(), u32::from(MessageKind::EchoRequest.as_u8()));
}

#[test]
fn missing_name_is_reported_not_fatal() {
    let catalog = catalog();
    let mut registry = ModuleRegistry::new();

    let err = registry.load(&catalog, "nameless", "").unwrap_err();
    assert!(matches!(
        err,
        LoadError::MissingRequiredSymbol { symbol: "name", .. }
    ));

    // The next module still loads.
    registry.load(&catalog, "minimal", "").unwrap();
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["minimal"]);
}

#[test]
fn missing_shared_object_cannot_be_opened() {
    let mut registry = ModuleRegistry::new();
    let err = registry
        .load(&DylibLoader::new(), "/nonexistent/libofbench_nothing.so", "")
        .unwrap_err();

    match err {
        LoadError::CannotOpen { reference, .. } => {
            assert_eq!(reference, "/nonexistent/libofbench_nothing.so");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(registry.is_empty());
}
