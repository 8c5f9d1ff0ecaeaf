mod common;

use common::*;
use odata_client::{
    header_str, ClientEntity, ClientError, DataServiceRequestArgs, DataServiceSaveStream,
    EntityStates, HasCore, HeaderValue, Method, SaveChangesOptions, SaveState, StatusCode,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[tokio::test]
async fn test_second_insert_fails_in_single_changeset() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    let first = ctx.add_object("Customers", customer(1)).unwrap();
    let second = ctx.add_object("Customers", customer(2)).unwrap();

    transport.push(
        BatchResponse::new()
            .changeset(vec![
                Part::created(1, "http://svc/odata/Customers(1)"),
                Part::error(400, "Name is invalid").id(2),
            ])
            .build(),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    ctx.on_receiving_response(move |args| {
        seen.lock()
            .push((args.status_code.as_u16(), args.is_batch_part, args.descriptor.is_some()))
    });

    let err = ctx
        .save_changes_with(SaveChangesOptions::batch_single_changeset())
        .await
        .unwrap_err();
    let ClientError::Request(request_error) = err else {
        panic!("expected an aggregate request error, got {err:?}");
    };

    assert_eq!(request_error.response.len(), 2);
    assert!(request_error.response.responses[0].error().is_none());
    let failure = request_error.response.responses[1].error().unwrap();
    assert!(
        matches!(failure.as_ref(), ClientError::Client(e) if e.status_code == StatusCode::BAD_REQUEST && e.message == "Name is invalid")
    );
    assert!(matches!(request_error.source.as_ref(), ClientError::Client(_)));
    println!("✓ the first operation error was wrapped with the partial responses");

    let first = ctx.entity_descriptor(first).unwrap();
    assert_eq!(first.read().state(), EntityStates::Unchanged);
    assert_eq!(
        first.read().identity().map(|u| u.as_str()),
        Some("http://svc/odata/Customers(1)")
    );

    let second = ctx.entity_descriptor(second).unwrap();
    assert_eq!(second.read().state(), EntityStates::Added);
    assert!(second.read().core().save_error.is_some());

    // The failed part reaches the handler without its descriptor.
    assert_eq!(
        *events.lock(),
        vec![(200, false, false), (201, true, true), (400, true, false)]
    );
    assert_eq!(ctx.save_state(), SaveState::Faulted);
}

#[tokio::test]
async fn test_independent_operations_keep_sibling_success() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    let first = ctx.add_object("Customers", customer(1)).unwrap();
    let second = ctx.add_object("Customers", customer(2)).unwrap();

    transport.push(
        BatchResponse::new()
            .changeset(vec![Part::error(409, "conflict").id(1)])
            .changeset(vec![Part::created(2, "http://svc/odata/Customers(2)")])
            .build(),
    );

    let response = ctx
        .save_changes_with(SaveChangesOptions::batch_independent_operations())
        .await
        .unwrap();

    assert_eq!(response.len(), 2);
    assert!(response.responses[0].error().is_some());
    assert!(response.responses[1].error().is_none());
    assert_eq!(
        ctx.entity_descriptor(first).unwrap().read().state(),
        EntityStates::Added
    );
    assert_eq!(
        ctx.entity_descriptor(second).unwrap().read().state(),
        EntityStates::Unchanged
    );
    assert_eq!(ctx.save_state(), SaveState::Completed);

    let body = transport.request_body(0);
    assert_eq!(body.matches("boundary=changeset_").count(), 2);
    println!("✓ each change was framed in its own changeset");
}

#[tokio::test]
async fn test_batch_round_trip_in_change_order() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());

    let parent = ctx.add_object("Customers", customer(1)).unwrap();
    let child = ctx
        .add_related_object(parent, "Orders", ClientEntity::new("Order").with("Id", 10))
        .unwrap();
    let existing = ctx
        .attach_to("Customers", customer(3), Some("W/\"1\"".to_string()))
        .unwrap();
    ctx.set_property(existing, "Name", "renamed").unwrap();
    ctx.on_sending_request(|args| {
        if args.is_batch_part {
            args.headers.insert("x-trace", HeaderValue::from_static("t1"));
        }
    });

    transport.push(
        BatchResponse::new()
            .changeset(vec![
                Part::created(1, "http://svc/odata/Customers(1)"),
                Part::created(2, "http://svc/odata/Orders(10)"),
                Part::new(204).id(5).header("ETag", "W/\"2\""),
            ])
            .build(),
    );

    let response = ctx
        .save_changes_with(SaveChangesOptions::batch_single_changeset())
        .await
        .unwrap();
    assert_eq!(response.len(), 3);

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].uri.as_str(), "http://svc/odata/$batch");
    assert!(header_str(&requests[0].headers, "Content-Type")
        .unwrap()
        .starts_with("multipart/mixed; boundary=batch_"));

    let body = transport.request_body(0);
    assert_eq!(content_ids(&body), vec![1, 2, 5]);
    assert_eq!(
        request_lines(&body),
        vec![
            "POST http://svc/odata/Customers".to_string(),
            "POST $1/Orders".to_string(),
            "PATCH http://svc/odata/Customers(3)".to_string(),
        ]
    );
    assert!(body.contains("if-match: W/\"1\""));
    assert!(body.contains(r#"{"Name":"renamed"}"#));
    assert_eq!(body.matches("x-trace: t1").count(), 3);
    println!("✓ the batch was written in change order with $-references");

    for handle in [parent, child, existing] {
        let entity = ctx.entity_descriptor(handle).unwrap();
        assert_eq!(entity.read().state(), EntityStates::Unchanged);
    }
    assert_eq!(
        ctx.entity_descriptor(child).unwrap().read().identity().map(|u| u.as_str()),
        Some("http://svc/odata/Orders(10)")
    );
    assert_eq!(
        ctx.entity_descriptor(existing).unwrap().read().etag.as_deref(),
        Some("W/\"2\"")
    );
    let link = ctx.link_descriptor(parent, "Orders", Some(child)).unwrap();
    assert_eq!(link.read().state(), EntityStates::Unchanged);
    assert!(ctx.tracker().changed_entries().is_empty());
}

#[tokio::test]
async fn test_content_ids_resolve_out_of_order() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    let first = ctx.add_object("Customers", customer(1)).unwrap();
    let second = ctx.add_object("Customers", customer(2)).unwrap();

    transport.push(
        BatchResponse::new()
            .changeset(vec![
                Part::created(2, "http://svc/odata/Customers(2)"),
                Part::created(1, "http://svc/odata/Customers(1)"),
            ])
            .build(),
    );

    let response = ctx
        .save_changes_with(SaveChangesOptions::batch_single_changeset())
        .await
        .unwrap();

    let answered = response.responses[0].as_change().unwrap().descriptor.clone().unwrap();
    assert_eq!(answered.change_order(), 2);
    assert_eq!(
        ctx.entity_descriptor(first).unwrap().read().identity().map(|u| u.to_string()),
        Some("http://svc/odata/Customers(1)".to_string())
    );
    assert_eq!(
        ctx.entity_descriptor(second).unwrap().read().identity().map(|u| u.to_string()),
        Some("http://svc/odata/Customers(2)".to_string())
    );
}

#[tokio::test]
async fn test_unknown_content_id_is_unexpected_content() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    ctx.add_object("Customers", customer(1)).unwrap();

    transport.push(
        BatchResponse::new()
            .changeset(vec![Part::created(99, "http://svc/odata/Customers(1)")])
            .build(),
    );

    let err = ctx
        .save_changes_with(SaveChangesOptions::batch_single_changeset())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidOperation(ref m) if m.contains("unexpected content")));
    assert_eq!(ctx.save_state(), SaveState::Faulted);
}

#[tokio::test]
async fn test_failed_part_with_unmatched_content_id_has_no_descriptor() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    let first = ctx.add_object("Customers", customer(1)).unwrap();
    let second = ctx.add_object("Customers", customer(2)).unwrap();
    let third = ctx.add_object("Customers", customer(3)).unwrap();

    transport.push(
        BatchResponse::new()
            .changeset(vec![Part::error(409, "conflict").id(99)])
            .changeset(vec![Part::error(412, "stale").raw_id("first")])
            .changeset(vec![Part::created(3, "http://svc/odata/Customers(3)")])
            .build(),
    );

    let response = ctx
        .save_changes_with(SaveChangesOptions::batch_independent_operations())
        .await
        .unwrap();
    assert_eq!(response.len(), 3);

    for (index, expected) in [(0, StatusCode::CONFLICT), (1, StatusCode::PRECONDITION_FAILED)] {
        let failed = response.responses[index].as_change().unwrap();
        assert!(failed.descriptor.is_none());
        assert_eq!(failed.status_code, expected);
        assert!(
            matches!(failed.error.as_deref(), Some(ClientError::Client(e)) if e.status_code == expected)
        );
    }
    assert!(response.responses[2].error().is_none());

    for handle in [first, second] {
        let entity = ctx.entity_descriptor(handle).unwrap();
        assert_eq!(entity.read().state(), EntityStates::Added);
        assert!(entity.read().core().save_error.is_none());
    }
    assert_eq!(
        ctx.entity_descriptor(third).unwrap().read().state(),
        EntityStates::Unchanged
    );
    assert_eq!(ctx.save_state(), SaveState::Completed);
    println!("✓ failures that name no change are reported without a descriptor");
}

#[tokio::test]
async fn test_media_entries_are_rejected_before_sending() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    let plain = ctx.add_object("Customers", customer(1)).unwrap();
    let photo = ctx
        .add_object("Photos", ClientEntity::new("Photo").with("Id", 1))
        .unwrap();
    ctx.set_save_stream(
        photo,
        DataServiceSaveStream::from_bytes(
            b"PNG".to_vec(),
            DataServiceRequestArgs::with_content_type("image/png"),
        ),
    )
    .unwrap();

    let err = ctx
        .save_changes_with(SaveChangesOptions::batch_single_changeset())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotSupported(_)));
    assert!(transport.requests().is_empty());
    assert!(!ctx.entity_descriptor(plain).unwrap().read().core().content_generated_for_save);
    assert_eq!(ctx.save_state(), SaveState::Faulted);
    println!("✓ media link entry rejected with nothing sent");
}

#[tokio::test]
async fn test_named_streams_are_rejected_in_a_batch() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    let saved = ctx.attach_to("Customers", customer(1), None).unwrap();
    ctx.set_named_save_stream(
        saved,
        "Avatar",
        DataServiceSaveStream::from_bytes(
            b"JPG".to_vec(),
            DataServiceRequestArgs::with_content_type("image/jpeg"),
        ),
    )
    .unwrap();

    let err = ctx
        .save_changes_with(SaveChangesOptions::batch_independent_operations())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotSupported(_)));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_link_changes_round_trip() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    let a = ctx.attach_to("Customers", customer(1), None).unwrap();
    let b = ctx.attach_to("Customers", customer(2), None).unwrap();
    let order = ctx
        .attach_to("Orders", ClientEntity::new("Order").with("Id", 5), None)
        .unwrap();
    let old_order = ctx
        .attach_to("Orders", ClientEntity::new("Order").with("Id", 6), None)
        .unwrap();
    ctx.attach_link(a, "Orders", Some(old_order)).unwrap();

    ctx.add_link(a, "Orders", order).unwrap();
    ctx.set_link(a, "BestFriend", Some(b)).unwrap();
    ctx.delete_link(a, "Orders", old_order).unwrap();

    transport.push(
        BatchResponse::new()
            .changeset(vec![
                Part::new(204).id(6),
                Part::new(204).id(7),
                Part::new(204).id(8),
            ])
            .build(),
    );
    ctx.save_changes_with(SaveChangesOptions::batch_single_changeset())
        .await
        .unwrap();

    let body = transport.request_body(0);
    assert_eq!(content_ids(&body), vec![6, 7, 8]);
    assert_eq!(
        request_lines(&body),
        vec![
            "POST http://svc/odata/Customers(1)/Orders/$ref".to_string(),
            "PUT http://svc/odata/Customers(1)/BestFriend/$ref".to_string(),
            "DELETE http://svc/odata/Customers(1)/Orders/$ref?$id=http://svc/odata/Orders(6)".to_string(),
        ]
    );
    assert!(body.contains(r#"{"@odata.id":"http://svc/odata/Orders(5)"}"#));

    assert_eq!(
        ctx.link_descriptor(a, "Orders", Some(order)).unwrap().read().state(),
        EntityStates::Unchanged
    );
    assert_eq!(
        ctx.link_descriptor(a, "BestFriend", Some(b)).unwrap().read().state(),
        EntityStates::Unchanged
    );
    assert!(ctx.link_descriptor(a, "Orders", Some(old_order)).is_none());
}

#[tokio::test]
async fn test_saving_again_sends_nothing() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    ctx.add_object("Customers", customer(1)).unwrap();
    transport.push(
        BatchResponse::new()
            .changeset(vec![Part::created(1, "http://svc/odata/Customers(1)")])
            .build(),
    );

    let options = SaveChangesOptions::batch_single_changeset();
    assert_eq!(ctx.save_changes_with(options).await.unwrap().len(), 1);
    let again = ctx.save_changes_with(options).await.unwrap();
    assert!(again.is_empty());
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(ctx.save_state(), SaveState::Completed);
}

#[tokio::test]
async fn test_top_level_failure_is_returned_directly() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    ctx.add_object("Customers", customer(1)).unwrap();
    transport.push(
        BatchResponse::new()
            .part(Part::error(400, "batching is disabled"))
            .build(),
    );

    let err = ctx
        .save_changes_with(SaveChangesOptions::batch_single_changeset())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Client(ref e) if e.message == "batching is disabled"));
}

#[tokio::test]
async fn test_batch_status_failure_keeps_status() {
    let transport = ScriptedTransport::new();
    let ctx = context(transport.clone());
    ctx.add_object("Customers", customer(1)).unwrap();
    transport.push(response(
        503,
        &[("Content-Type", "application/json")],
        r#"{"error":{"code":"","message":"service unavailable"}}"#,
    ));

    let err = ctx
        .save_changes_with(SaveChangesOptions::batch_independent_operations())
        .await
        .unwrap_err();
    let ClientError::Request(request_error) = err else {
        panic!("expected an aggregate request error, got {err:?}");
    };
    assert_eq!(
        request_error.response.batch_status_code,
        Some(StatusCode::SERVICE_UNAVAILABLE)
    );
    assert!(request_error.response.is_empty());
    assert!(
        matches!(request_error.source.as_ref(), ClientError::Client(e) if e.message == "service unavailable" && e.code.is_none())
    );
}

#[tokio::test]
async fn test_continue_on_error_is_rejected_for_single_changeset() {
    let ctx = context(ScriptedTransport::new());
    ctx.add_object("Customers", customer(1)).unwrap();
    let err = ctx
        .save_changes_with(SaveChangesOptions::batch_single_changeset().continue_on_error())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Argument(_)));
}
