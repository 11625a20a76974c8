#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use promoter_core::config::parse_mapping;
use promoter_core::{BuildHash, ConfigBuilder, Layer, PromoterConfig};

pub const TARGET: &str = "current-tripleo";
pub const CANDIDATE: &str = "tripleo-ci-testing";
pub const STANDALONE: &str = "periodic-tripleo-ci-centos-8-standalone-master";
pub const QCOW_IMAGES: [&str; 2] = ["ironic-python-agent.tar", "overcloud-full.tar"];

const RELEASE: &str = r#"
release: master
distro_name: centos
distro_version: 8
dlrn_api_host: trunk.example.org
promotions:
  current-tripleo:
    candidate_label: tripleo-ci-testing
    criteria:
      - periodic-tripleo-ci-centos-8-standalone-master
"#;

/// Config whose playbook is `sh <script>` and whose qcow server is the
/// local directory `images_root`.
pub fn config(workdir: &Path, script: &Path, images_root: &Path, timeout_secs: u64) -> Arc<PromoterConfig> {
    let extra = format!(
        r#"
playbook_command: "sh {script}"
container_push_playbook: "{workdir}/container-push.yml"
container_push_logdir: "{workdir}/logs"
subprocess_timeout_secs: {timeout_secs}
overcloud_images:
  qcow_servers:
    local:
      host: localhost
      root: "{root}"
      client: os
  qcow_images:
    - ironic-python-agent.tar
    - overcloud-full.tar
"#,
        script = script.display(),
        workdir = workdir.display(),
        root = images_root.display(),
    );
    Arc::new(
        ConfigBuilder::new()
            .layer(Layer::Release, parse_mapping(RELEASE, "release").expect("release yaml"))
            .layer(Layer::Extra, parse_mapping(&extra, "extra").expect("extra yaml"))
            .build_with_password(Some("secret".to_string()))
            .expect("valid config"),
    )
}

/// A fake playbook: copies its extra-vars file next to itself, records
/// the extra-vars path, prints colored output and exits with `exit_code`.
pub fn write_playbook(workdir: &Path, body: &str, exit_code: i32) -> PathBuf {
    let script = workdir.join("fake-playbook.sh");
    let content = format!(
        "# args: -v -e @<extra_vars> <playbook>\n\
         vars=\"${{3#@}}\"\n\
         cp \"$vars\" \"{dir}/captured-vars.yaml\"\n\
         echo \"$vars\" > \"{dir}/vars-path\"\n\
         {body}\n\
         exit {exit_code}\n",
        dir = workdir.display(),
    );
    std::fs::write(&script, content).expect("write script");
    script
}

/// `<root>/centos8/master/rdo_trunk` with one populated directory per hash.
pub fn images_tree(root: &Path, hashes: &[&BuildHash]) -> PathBuf {
    let dir = root.join("centos8").join("master").join("rdo_trunk");
    for hash in hashes {
        let hash_dir = dir.join(hash.full_hash());
        std::fs::create_dir_all(&hash_dir).expect("hash dir");
        for image in QCOW_IMAGES {
            std::fs::write(hash_dir.join(image), b"image").expect("image");
        }
    }
    dir
}

pub fn link(dir: &Path, name: &str) -> Option<PathBuf> {
    std::fs::read_link(dir.join(name)).ok()
}
