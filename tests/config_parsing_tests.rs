use server_proxy::config::{AppConfig, FromYaml, ServerConfig};

#[test]
fn parses_a_single_server_config() {
    let yaml = "
host: 0.0.0.0
ports: [80, 443]
server_name: myserv
client_max_body_size: 2048
routes:
  - path: /
    root: ./www
";
    let config = ServerConfig::from_str(yaml).unwrap();

    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.ports, vec![80, 443]);
    assert_eq!(config.server_name, "myserv");
    assert_eq!(config.client_max_body_size, 2048);
    assert_eq!(config.routes[0].path, "/");
}

#[test]
fn parses_a_full_app_config_with_several_servers() {
    let yaml = r#"
servers:
  - server_name: web1
    host: 127.0.0.1
    ports: [8080, 8081]
    routes:
      - path: /
        root: ./web1/www
  - server_name: web2
    host: 127.0.0.1
    ports: [9090]
    routes:
      - path: /
        root: ./web2/www
"#;
    let config = AppConfig::from_str(yaml).unwrap();

    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.servers[0].server_name, "web1");
    assert_eq!(config.servers[1].ports, vec![9090]);
}

#[test]
fn omitted_fields_fall_back_to_their_defaults() {
    let yaml = "server_name: test_default";
    let config = ServerConfig::from_str(yaml).unwrap();

    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.ports, vec![8080]);
    assert!(config.routes.is_empty());
    assert!(config.error_pages.is_empty());
}

#[test]
fn an_unrecognized_field_is_skipped_rather_than_rejected() {
    let yaml = "
host: 127.0.0.1
fake_setting: 123
server_name: test
";
    let config = ServerConfig::from_str(yaml).unwrap();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.server_name, "test");
}

#[test]
fn a_route_missing_its_path_falls_back_to_the_default_route_rather_than_failing() {
    let yaml = "
routes:
  - root: /tmp
";
    let config = ServerConfig::from_str(yaml).unwrap();
    assert_eq!(config.routes[0].path, "/");
    assert_eq!(config.routes[0].root, "/tmp");
}

#[test]
fn repeating_a_field_is_a_hard_error() {
    let yaml = "
host: 1.2.3.4
host: 5.6.7.8
";
    let err = ServerConfig::from_str(yaml).unwrap_err();
    assert!(err.message.contains("Duplicate field 'host'"));
}

#[test]
fn bool_fields_never_fail_to_parse_and_only_recognize_true_and_on() {
    assert!(ServerConfig::from_str("default_server: true").unwrap().default_server);
    assert!(ServerConfig::from_str("default_server: on").unwrap().default_server);
    assert!(!ServerConfig::from_str("default_server: yes").unwrap().default_server);
    assert!(!ServerConfig::from_str("default_server: false").unwrap().default_server);
}

#[test]
fn a_non_numeric_value_for_a_numeric_field_is_rejected() {
    let yaml = "client_max_body_size: abc";
    let err = ServerConfig::from_str(yaml).unwrap_err();
    assert!(err.message.contains("Expected number"));
}

#[test]
fn a_non_numeric_entry_in_a_numeric_list_is_rejected() {
    let yaml = "ports: [80, 'abc']";
    let err = ServerConfig::from_str(yaml).unwrap_err();
    assert!(err.message.contains("Expected number"));
}

#[test]
fn a_port_above_u16_range_is_rejected() {
    let yaml = "ports: [70000]";
    let err = ServerConfig::from_str(yaml).unwrap_err();
    assert!(err.message.contains("out of range"));
}

#[test]
fn malformed_key_value_syntax_is_an_error() {
    let yaml = "host: : 127.0.0.1";
    assert!(ServerConfig::from_str(yaml).is_err());
}

#[test]
fn a_bare_word_where_a_key_colon_value_pair_is_expected_is_rejected() {
    let err = ServerConfig::from_str("host: 127.0.0.1\nextra").unwrap_err();
    assert!(err.message.contains("Expected key-value pair"));
}
