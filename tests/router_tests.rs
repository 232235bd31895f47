use server_proxy::config::{RouteConfig, RoutingError, ServerConfig};

fn route(path: &str, methods: &[&str]) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
        ..Default::default()
    }
}

fn server_with_routes(routes: Vec<RouteConfig>) -> ServerConfig {
    ServerConfig { routes, ..Default::default() }
}

#[test]
fn matches_the_root_route() {
    let cfg = server_with_routes(vec![route("/", &["GET"])]);
    let found = cfg.find_route("/", "GET").unwrap();
    assert_eq!(found.path, "/");
}

#[test]
fn falls_back_to_the_root_route_for_an_unconfigured_path() {
    let cfg = server_with_routes(vec![route("/", &["GET"])]);
    let found = cfg.find_route("/unconfigured", "GET").unwrap();
    assert_eq!(found.path, "/");
}

#[test]
fn picks_the_longest_matching_prefix() {
    let cfg = server_with_routes(vec![route("/a", &["GET"]), route("/a/b", &["GET"])]);
    let found = cfg.find_route("/a/b/c", "GET").unwrap();
    assert_eq!(found.path, "/a/b");
}

#[test]
fn rejects_a_method_the_matched_route_does_not_allow() {
    let cfg = server_with_routes(vec![route("/", &["GET"])]);
    let err = cfg.find_route("/", "POST").unwrap_err();
    assert!(matches!(err, RoutingError::MethodNotAllowed));
}

#[test]
fn reports_not_found_when_nothing_matches_as_a_prefix() {
    let cfg = server_with_routes(vec![route("/a", &["GET"])]);
    let err = cfg.find_route("/b", "GET").unwrap_err();
    assert!(matches!(err, RoutingError::NotFound));
}

#[test]
fn an_empty_route_list_never_matches() {
    let cfg = server_with_routes(vec![]);
    let err = cfg.find_route("/", "GET").unwrap_err();
    assert!(matches!(err, RoutingError::NotFound));
}

#[test]
fn find_fastcgi_matches_by_extension_suffix() {
    use server_proxy::config::FastcgiExtensionConfig;
    let mut cfg = ServerConfig::default();
    cfg.fastcgi.push(FastcgiExtensionConfig { extension: ".php".to_string(), ..Default::default() });

    assert!(cfg.find_fastcgi("/index.php").is_some());
    assert!(cfg.find_fastcgi("/style.css").is_none());
}

#[test]
fn find_fastcgi_matches_by_path_prefix_when_the_key_ends_in_a_slash() {
    use server_proxy::config::FastcgiExtensionConfig;
    let mut cfg = ServerConfig::default();
    cfg.fastcgi.push(FastcgiExtensionConfig { extension: "/fcgi-bin/".to_string(), ..Default::default() });

    assert!(cfg.find_fastcgi("/fcgi-bin/app").is_some());
    assert!(cfg.find_fastcgi("/other/app").is_none());
}
