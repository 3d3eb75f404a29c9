use bazaar_service::config::make_config_loader;
use test_r::test;

/// Full environment-driven configuration, the way the process is deployed.
#[test]
fn spec_environment_variables_map_onto_the_config() {
    let vars = [
        ("INGRESS_HOSTNAME", "bazaar.example.com"),
        ("PRIVATE_MODEL_BAZAAR_ENDPOINT", "http://bazaar.internal:8080"),
        ("SHARE_DIR", "/mnt/share"),
        ("DATABASE_URI", "postgres://bazaar:pw@db:5432/bazaar"),
        ("JWT_SECRET", "very-secret"),
        ("ADMIN_USERNAME", "root"),
        ("ADMIN_MAIL", "root@example.com"),
        ("ADMIN_PASSWORD", "root-password"),
        ("IDENTITY_PROVIDER", "basic"),
        ("NOMAD_ENDPOINT", "http://nomad:4646"),
        ("TASK_RUNNER_TOKEN", "nomad-acl-token"),
        ("JOB_DRIVER", "docker"),
        ("TAG", "v2.1.0"),
    ];
    for (key, value) in vars {
        std::env::set_var(key, value);
    }

    let config = make_config_loader().load().expect("Failed to load config");

    for (key, _) in vars {
        std::env::remove_var(key);
    }

    assert_eq!(config.ingress_hostname, "bazaar.example.com");
    assert_eq!(config.public_endpoint, "http://bazaar.internal:8080");
    assert_eq!(config.share_dir.to_string_lossy(), "/mnt/share");
    assert_eq!(config.db.uri, "postgres://bazaar:pw@db:5432/bazaar");
    assert_eq!(config.jwt.secret, "very-secret");
    assert_eq!(config.admin.username, "root");
    assert_eq!(config.admin.email, "root@example.com");
    assert_eq!(config.identity.provider, "basic");
    assert_eq!(
        config.orchestrator.nomad_endpoint.as_deref(),
        Some("http://nomad:4646")
    );
    assert_eq!(
        config.orchestrator.nomad_token.as_deref(),
        Some("nomad-acl-token")
    );
    assert_eq!(config.driver.mode, "docker");
    assert_eq!(config.driver.tag.as_deref(), Some("v2.1.0"));
    assert_eq!(config.driver.docker_image(), "docker.io/modelbazaar/bazaar-jobs:v2.1.0");

    config.validate().expect("env-driven config must validate");
}
