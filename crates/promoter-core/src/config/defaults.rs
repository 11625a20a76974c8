//! Built-in global defaults, the lowest configuration layer.

/// Global defaults shared by every environment and release.
pub const GLOBAL_DEFAULTS: &str = r#"
dlrn_api_scheme: https
dlrn_api_port: 443
dlrnauth_username: ciuser
latest_hashes_count: 10
log_level: INFO
log_file: "~/web/promoter_logs/{{ distro }}_{{ release }}.log"
allowed_clients: registries_client,qcow_client,dlrn_client
create_previous: true
manifest_push: false
target_registries_push: true
dry_run: false
repo_url: "https://{{ dlrn_api_host }}/{{ distro }}-{{ release }}"
containers_list_base_url: "https://opendev.org/openstack/tripleo-common/raw/commit/"
containers_list_path: "container-images/tripleo_containers.yaml"
containers_list_exclude_config: "https://opendev.org/openstack/tripleo-ci/raw/branch/master/ci-scripts/dlrnapi_promoter/config_environments/containers_exclude.yaml"
tripleo_common_project: openstack-tripleo-common
script_root: "."
container_push_playbook: "{{ script_root }}/container-push/container-push.yml"
container_push_logdir: "~/web/promoter_logs/container-push"
playbook_command: ansible-playbook
http_timeout_secs: 60
subprocess_timeout_secs: 300
qcow_validation: true
default_qcow_server: local
overcloud_images:
  qcow_servers:
    local:
      host: localhost
      root: "~/overcloud_images"
      client: os
  qcow_images:
    - ironic-python-agent.tar
    - ironic-python-agent.tar.md5
    - overcloud-full.tar
    - overcloud-full.tar.md5
"#;
