use mbmirror::sync::rewrite::{rewrite_message, MalformedHeader};
use mbmirror::types::Tuid;

fn tuid() -> Tuid {
    Tuid::from_bytes(b"AbCdEfGhIjK+").unwrap()
}

#[test]
fn tag_is_inserted_at_the_header_boundary() {
    let body = b"From: a@b\nSubject: hi\n\nthe body\n";
    let out = rewrite_message(body, Some(&tuid()), false, false).unwrap();
    assert_eq!(
        out,
        b"From: a@b\nSubject: hi\nX-TUID: AbCdEfGhIjK+\n\nthe body\n"
    );
}

#[test]
fn existing_tag_is_replaced_in_place() {
    let body = b"From: a@b\nX-TUID: 000000000000\nSubject: hi\n\nbody\n";
    let out = rewrite_message(body, Some(&tuid()), false, false).unwrap();
    assert_eq!(
        out,
        b"From: a@b\nX-TUID: AbCdEfGhIjK+\nSubject: hi\n\nbody\n"
    );
}

#[test]
fn tag_survives_a_round_trip() {
    let body = b"From: a@b\n\nbody\n";
    let t = Tuid::random();
    let out = rewrite_message(body, Some(&t), false, false).unwrap();
    let expect = format!("X-TUID: {t}\n");
    assert!(
        String::from_utf8(out).unwrap().contains(&expect),
        "the journaled TUID must be readable back from the message"
    );
}

#[test]
fn crlf_source_is_stripped_for_lf_destination() {
    let body = b"From: a@b\r\nSubject: hi\r\n\r\nline one\r\nline two\r\n";
    let out = rewrite_message(body, None, true, false).unwrap();
    assert_eq!(out, b"From: a@b\nSubject: hi\n\nline one\nline two\n");
}

#[test]
fn lf_source_is_expanded_for_crlf_destination() {
    let body = b"From: a@b\nSubject: hi\n\nbody\n";
    let out = rewrite_message(body, Some(&tuid()), false, true).unwrap();
    assert_eq!(
        out,
        b"From: a@b\r\nSubject: hi\r\nX-TUID: AbCdEfGhIjK+\r\n\r\nbody\r\n"
    );
}

#[test]
fn inserted_tag_matches_surrounding_header_endings() {
    // Both sides CRLF: no conversion, but the new header line still gets
    // the terminator its neighbors use.
    let body = b"From: a@b\r\nSubject: hi\r\n\r\nbody\r\n";
    let out = rewrite_message(body, Some(&tuid()), true, true).unwrap();
    assert_eq!(
        out,
        b"From: a@b\r\nSubject: hi\r\nX-TUID: AbCdEfGhIjK+\r\n\r\nbody\r\n"
    );
}

#[test]
fn untouched_when_nothing_to_do() {
    let body = b"From: a@b\nSubject: hi\n\nbody\n";
    let out = rewrite_message(body, None, false, false).unwrap();
    assert_eq!(out, body);
}

#[test]
fn message_without_header_terminator_is_refused() {
    assert_eq!(
        rewrite_message(b"From: a@b\nSubject: hi\n", Some(&tuid()), false, false),
        Err(MalformedHeader)
    );
    assert_eq!(
        rewrite_message(b"no newline at all", Some(&tuid()), false, false),
        Err(MalformedHeader)
    );
}

#[test]
fn empty_headers_still_get_the_tag() {
    // A message that starts with the blank separator line.
    let out = rewrite_message(b"\nbody\n", Some(&tuid()), false, false).unwrap();
    assert_eq!(out, b"X-TUID: AbCdEfGhIjK+\n\nbody\n");
}
