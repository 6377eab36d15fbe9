use crate::message::{Host, Param, Scheme, Transport, Uri};

#[test]
fn test_parse_full_sip_uri() {
    let uri: Uri = "sip:alice:secret@atlanta.com:5060;transport=tcp;lr?subject=project"
        .parse()
        .unwrap();
    assert_eq!(uri.scheme, Some(Scheme::Sip));
    let auth = uri.auth.as_ref().unwrap();
    assert_eq!(auth.user, "alice");
    assert_eq!(auth.password.as_deref(), Some("secret"));
    assert!(matches!(&uri.host_with_port.host, Host::Domain(d) if d == "atlanta.com"));
    assert_eq!(uri.host_with_port.port, Some(5060));
    assert_eq!(uri.params[0], Param::Transport(Transport::Tcp));
    assert_eq!(uri.params[1], Param::Lr);
    assert_eq!(uri.headers, vec![("subject".to_string(), "project".to_string())]);
    assert_eq!(uri.transport(), Some(Transport::Tcp));
}

#[test]
fn test_uri_format_parse_round_trip() {
    for input in [
        "sip:bob@biloxi.com",
        "sips:bob@biloxi.com:5061",
        "sip:bob@192.0.2.4:5060;transport=tcp",
        "sip:[2001:db8::1]:5062;lr",
        "sip:carol@chicago.com;method=REGISTER?to=alice%40atlanta.com",
        "tel:+1-212-555-0101",
    ] {
        let uri: Uri = input.parse().unwrap();
        assert_eq!(uri.to_string(), input, "round trip of {}", input);
        let reparsed: Uri = uri.to_string().parse().unwrap();
        assert_eq!(reparsed, uri);
    }
}

#[test]
fn test_uri_equality_case_rules() {
    // Scheme and host compare case-insensitively, the user does not.
    let a: Uri = "sip:alice@AtLanTa.CoM;Transport=udp".parse().unwrap();
    let b: Uri = "sip:alice@atlanta.com;transport=udp".parse().unwrap();
    assert_eq!(a, b);

    let upper: Uri = "sip:ALICE@atlanta.com".parse().unwrap();
    let lower: Uri = "sip:alice@atlanta.com".parse().unwrap();
    assert_ne!(upper, lower);
}

#[test]
fn test_uri_equality_parameter_rules() {
    // transport present on one side only is a mismatch.
    let plain: Uri = "sip:alice@atlanta.com".parse().unwrap();
    let tcp: Uri = "sip:alice@atlanta.com;transport=tcp".parse().unwrap();
    assert_ne!(plain, tcp);

    // An extension parameter on one side only is ignored.
    let with_foo: Uri = "sip:alice@atlanta.com;foo=bar".parse().unwrap();
    assert_eq!(plain, with_foo);

    // But mismatching values of a parameter present on both sides differ.
    let with_baz: Uri = "sip:alice@atlanta.com;foo=baz".parse().unwrap();
    assert_ne!(with_foo, with_baz);
}

#[test]
fn test_ipv6_host_parses_bracketed() {
    let uri: Uri = "sip:[2001:db8::1]:5060".parse().unwrap();
    assert!(matches!(uri.host_with_port.host, Host::Ip(ip) if ip.is_ipv6()));
    assert_eq!(uri.host_with_port.port, Some(5060));
}

#[test]
fn test_rport_parameter_forms() {
    assert_eq!(Param::parse("rport").unwrap(), Param::Rport(None));
    assert_eq!(Param::parse("rport=5060").unwrap(), Param::Rport(Some(5060)));
    assert_eq!(Param::Rport(None).to_string(), "rport");
    assert_eq!(Param::Rport(Some(5060)).to_string(), "rport=5060");
}
