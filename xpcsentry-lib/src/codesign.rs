//! Code-signing identity of executables.
//!
//! [`CodeIdentityResolver`] turns a program path into a [`CodeIdentity`].
//! The signature itself is read by a [`SigningInspector`]; the production
//! implementation, [`CodesignTool`], runs the system `codesign` and `plutil`
//! tools and parses their output with the pure `parse_*` functions below.
//!
//! Failures never surface as errors to callers of
//! [`CodeIdentityResolver::identify`]: an unsigned or unreadable program
//! simply has empty identity fields.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::CodesignConfig;
use crate::models::CodeIdentity;

const TEAM_ENTITLEMENT: &str = "com.apple.developer.team-identifier";
const LEAF_OU_CLAUSE: &str = "certificate leaf[subject.OU]";

/// Errors reading a code signature.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Code object is not signed: {}", path.display())]
    NotSigned { path: PathBuf },
}

/// Raw signing information of one code object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningDetails {
    /// Signing identifier
    pub identifier: Option<String>,
    /// Team identifier from the signature itself
    pub team_identifier: Option<String>,
    /// Team declared by the `com.apple.developer.team-identifier` entitlement
    pub entitlement_team: Option<String>,
    /// Team named by the designated requirement's leaf certificate OU
    pub requirement_team: Option<String>,
}

impl SigningDetails {
    /// Team identifier in fallback order: signature, entitlement, requirement.
    pub fn team(&self) -> Option<&str> {
        self.team_identifier
            .as_deref()
            .or(self.entitlement_team.as_deref())
            .or(self.requirement_team.as_deref())
    }
}

/// Reads code signatures and bundle metadata.
pub trait SigningInspector: Send + Sync {
    fn signing_details(&self, path: &Path) -> Result<SigningDetails, IdentityError>;

    /// Main executable declared by a bundle's `Info.plist`.
    fn bundle_executable(&self, bundle: &Path) -> Option<PathBuf>;
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim().trim_matches('"');
    (!value.is_empty()).then(|| value.to_owned())
}

/// Extracts `Identifier=` and `TeamIdentifier=` from `codesign -d --verbose=2` output.
pub fn parse_codesign_details(output: &str) -> SigningDetails {
    let mut details = SigningDetails::default();
    for line in output.lines() {
        if let Some(value) = line.strip_prefix("Identifier=") {
            details.identifier = non_empty(value);
        } else if let Some(value) = line.strip_prefix("TeamIdentifier=") {
            details.team_identifier = non_empty(value).filter(|v| v != "not set");
        }
    }
    details
}

/// Extracts the team entitlement from `codesign -d --entitlements - --xml` output.
pub fn parse_entitlements_team(plist: &str) -> Option<String> {
    let key = format!("<key>{TEAM_ENTITLEMENT}</key>");
    let start = plist.find(&key)?.checked_add(key.len())?;
    let rest = plist.get(start..)?.trim_start();
    let value = rest.strip_prefix("<string>")?;
    let end = value.find("</string>")?;
    non_empty(value.get(..end)?)
}

/// Extracts the leaf certificate OU from a designated requirement such as
/// `designated => anchor apple generic and certificate leaf[subject.OU] = "ABCDE12345"`.
pub fn parse_requirement_team(requirement: &str) -> Option<String> {
    let start = requirement.find(LEAF_OU_CLAUSE)?;
    let rest = requirement.get(start..)?.get(LEAF_OU_CLAUSE.len()..)?.trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let value: String = match rest.strip_prefix('"') {
        Some(quoted) => quoted.chars().take_while(|c| *c != '"').collect(),
        None => rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != ')')
            .collect(),
    };
    non_empty(&value)
}

/// The outermost `.app` directory containing `path`, if any.
pub fn enclosing_app_bundle(path: &Path) -> Option<&Path> {
    path.ancestors()
        .skip(1)
        .filter(|ancestor| ancestor.extension().is_some_and(|ext| ext == "app"))
        .last()
}

fn is_bundle(path: &Path) -> bool {
    path.join("Contents").join("Info.plist").is_file()
}

/// [`SigningInspector`] backed by `codesign` and `plutil`.
#[derive(Debug, Clone)]
pub struct CodesignTool {
    codesign: PathBuf,
    plutil: PathBuf,
}

impl Default for CodesignTool {
    fn default() -> Self {
        Self::from_config(&CodesignConfig::default())
    }
}

impl CodesignTool {
    pub fn from_config(config: &CodesignConfig) -> Self {
        Self {
            codesign: config.codesign_path.clone(),
            plutil: config.plutil_path.clone(),
        }
    }

    fn run(tool: &Path, args: &[&str], path: &Path) -> Result<Output, IdentityError> {
        trace!(tool = %tool.display(), ?args, path = %path.display(), "Running signing tool");
        Command::new(tool)
            .args(args)
            .arg(path)
            .output()
            .map_err(|source| IdentityError::Spawn {
                tool: tool.display().to_string(),
                source,
            })
    }

    /// `codesign -d` prints its report on stderr; newer releases also use stdout.
    fn combined(output: &Output) -> String {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        text
    }

    fn optional_query(&self, args: &[&str], path: &Path) -> Option<String> {
        match Self::run(&self.codesign, args, path) {
            Ok(output) if output.status.success() => Some(Self::combined(&output)),
            Ok(output) => {
                debug!(path = %path.display(), ?args, status = %output.status, "codesign query failed");
                None
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "codesign query failed");
                None
            }
        }
    }
}

impl SigningInspector for CodesignTool {
    fn signing_details(&self, path: &Path) -> Result<SigningDetails, IdentityError> {
        let output = Self::run(&self.codesign, &["-d", "--verbose=2"], path)?;
        let text = Self::combined(&output);
        if !output.status.success() {
            if text.contains("not signed") {
                return Err(IdentityError::NotSigned {
                    path: path.to_path_buf(),
                });
            }
            return Err(IdentityError::ToolFailed {
                tool: self.codesign.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let mut details = parse_codesign_details(&text);
        if details.team_identifier.is_none() {
            details.entitlement_team = self
                .optional_query(&["-d", "--entitlements", "-", "--xml"], path)
                .and_then(|plist| parse_entitlements_team(&plist));
        }
        if details.team().is_none() {
            details.requirement_team = self
                .optional_query(&["-d", "-r-"], path)
                .and_then(|requirement| parse_requirement_team(&requirement));
        }
        Ok(details)
    }

    fn bundle_executable(&self, bundle: &Path) -> Option<PathBuf> {
        let info_plist = bundle.join("Contents").join("Info.plist");
        let output = Self::run(
            &self.plutil,
            &["-extract", "CFBundleExecutable", "raw", "-o", "-"],
            &info_plist,
        )
        .ok()
        .filter(|output| output.status.success())?;

        let name = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        (!name.is_empty()).then(|| bundle.join("Contents").join("MacOS").join(name))
    }
}

/// Computes code identities, resolving bundles to their executables.
#[derive(Debug, Clone)]
pub struct CodeIdentityResolver<I> {
    inspector: I,
}

impl CodeIdentityResolver<CodesignTool> {
    pub fn from_config(config: &CodesignConfig) -> Self {
        Self::new(CodesignTool::from_config(config))
    }
}

impl<I: SigningInspector> CodeIdentityResolver<I> {
    pub const fn new(inspector: I) -> Self {
        Self { inspector }
    }

    /// Identity of the program at `path`. Never fails: unsigned programs and
    /// lookup failures produce empty signing and team identifiers.
    pub fn identify(&self, path: &str) -> CodeIdentity {
        if path.is_empty() {
            return CodeIdentity::unsigned(path);
        }

        let executable = self.executable_for(Path::new(path));
        let details = match self.inspector.signing_details(&executable) {
            Ok(details) => details,
            Err(e) => {
                debug!(path, error = %e, "No code identity");
                return CodeIdentity::unsigned(path);
            }
        };

        let team = match details.team() {
            Some(team) => team.to_owned(),
            None => self.enclosing_bundle_team(&executable).unwrap_or_default(),
        };
        CodeIdentity::new(path, details.identifier.unwrap_or_default(), team)
    }

    /// Resolves an application bundle directory to its main executable.
    fn executable_for(&self, path: &Path) -> PathBuf {
        if is_bundle(path)
            && let Some(executable) = self.inspector.bundle_executable(path)
        {
            return executable;
        }
        path.to_path_buf()
    }

    /// Team of the enclosing application's main executable. Looked up once,
    /// without further recursion.
    fn enclosing_bundle_team(&self, executable: &Path) -> Option<String> {
        let bundle = enclosing_app_bundle(executable)?;
        let main = self.inspector.bundle_executable(bundle)?;
        if main == executable {
            return None;
        }
        trace!(executable = %executable.display(), main = %main.display(), "Retrying team lookup via bundle executable");
        let details = self.inspector.signing_details(&main).ok()?;
        details.team().map(ToOwned::to_owned)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const SAFARI_DETAILS: &str = "\
Executable=/Applications/Safari.app/Contents/MacOS/Safari
Identifier=com.apple.Safari
Format=app bundle with Mach-O universal (x86_64 arm64e)
CodeDirectory v=20400 size=1234 flags=0x2000(library-validation) hashes=28+7 location=embedded
Signature size=4442
Authority=Software Signing
Authority=Apple Code Signing Certification Authority
Authority=Apple Root CA
Info.plist entries=42
TeamIdentifier=not set
Sealed Resources version=2 rules=13 files=2000
Internal requirements count=1 size=68
";

    const AGENT_DETAILS: &str = "\
Executable=/Users/csaby/Library/Developer/Xcode/DerivedData/SampleLaunchAgent
Identifier=com.xpc.example.agent
Format=Mach-O thin (arm64)
Authority=Apple Development: csaby@example.com (ABCDE12345)
TeamIdentifier=33YRLYRBYV
";

    const ENTITLEMENTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>com.apple.application-identifier</key>
	<string>33YRLYRBYV.com.xpc.example.agent</string>
	<key>com.apple.developer.team-identifier</key>
	<string>33YRLYRBYV</string>
</dict>
</plist>
"#;

    #[test]
    fn test_parse_codesign_details() {
        let details = parse_codesign_details(AGENT_DETAILS);
        assert_eq!(details.identifier.as_deref(), Some("com.xpc.example.agent"));
        assert_eq!(details.team_identifier.as_deref(), Some("33YRLYRBYV"));

        let platform = parse_codesign_details(SAFARI_DETAILS);
        assert_eq!(platform.identifier.as_deref(), Some("com.apple.Safari"));
        assert_eq!(platform.team_identifier, None);
    }

    #[test]
    fn test_parse_entitlements_team() {
        assert_eq!(parse_entitlements_team(ENTITLEMENTS).as_deref(), Some("33YRLYRBYV"));
        assert_eq!(parse_entitlements_team("<plist><dict></dict></plist>"), None);
        assert_eq!(
            parse_entitlements_team("<key>com.apple.developer.team-identifier</key><true/>"),
            None
        );
    }

    #[test]
    fn test_parse_requirement_team() {
        let quoted = r#"designated => identifier "com.xpc.example.agent" and anchor apple generic and certificate 1[field.1.2.840.113635.100.6.2.1] /* exists */ and certificate leaf[subject.OU] = "33YRLYRBYV""#;
        assert_eq!(parse_requirement_team(quoted).as_deref(), Some("33YRLYRBYV"));

        let bare = "designated => anchor apple generic and (certificate leaf[subject.OU] = 33YRLYRBYV)";
        assert_eq!(parse_requirement_team(bare).as_deref(), Some("33YRLYRBYV"));

        assert_eq!(parse_requirement_team("designated => anchor apple"), None);
    }

    #[test]
    fn test_enclosing_app_bundle_is_outermost() {
        let path = Path::new("/Applications/Foo.app/Contents/Library/LoginItems/Helper.app/Contents/MacOS/Helper");
        assert_eq!(enclosing_app_bundle(path), Some(Path::new("/Applications/Foo.app")));
        assert_eq!(enclosing_app_bundle(Path::new("/usr/libexec/helper")), None);
    }

    #[derive(Default)]
    struct ScriptedInspector {
        details: HashMap<PathBuf, SigningDetails>,
        bundles: HashMap<PathBuf, PathBuf>,
        lookups: Mutex<Vec<PathBuf>>,
    }

    impl SigningInspector for ScriptedInspector {
        fn signing_details(&self, path: &Path) -> Result<SigningDetails, IdentityError> {
            self.lookups.lock().unwrap().push(path.to_path_buf());
            self.details.get(path).cloned().ok_or_else(|| IdentityError::NotSigned {
                path: path.to_path_buf(),
            })
        }

        fn bundle_executable(&self, bundle: &Path) -> Option<PathBuf> {
            self.bundles.get(bundle).cloned()
        }
    }

    fn details(identifier: &str, team: Option<&str>) -> SigningDetails {
        SigningDetails {
            identifier: Some(identifier.to_owned()),
            team_identifier: team.map(ToOwned::to_owned),
            ..SigningDetails::default()
        }
    }

    #[test]
    fn test_identify_direct_signature() {
        let mut inspector = ScriptedInspector::default();
        inspector.details.insert(
            PathBuf::from("/usr/local/bin/agent"),
            details("com.xpc.example.agent", Some("33YRLYRBYV")),
        );
        let identity = CodeIdentityResolver::new(inspector).identify("/usr/local/bin/agent");
        assert_eq!(identity, CodeIdentity::new("/usr/local/bin/agent", "com.xpc.example.agent", "33YRLYRBYV"));
    }

    #[test]
    fn test_identify_unsigned_yields_empty_fields() {
        let resolver = CodeIdentityResolver::new(ScriptedInspector::default());
        let identity = resolver.identify("/tmp/unsigned");
        assert_eq!(identity.path, "/tmp/unsigned");
        assert!(identity.is_unsigned());
        assert!(resolver.identify("").is_unsigned());
    }

    #[test]
    fn test_team_fallback_order() {
        let all = SigningDetails {
            identifier: Some("x".to_owned()),
            team_identifier: Some("DIRECT".to_owned()),
            entitlement_team: Some("ENTITLED".to_owned()),
            requirement_team: Some("REQ".to_owned()),
        };
        assert_eq!(all.team(), Some("DIRECT"));
        let entitled = SigningDetails {
            team_identifier: None,
            ..all.clone()
        };
        assert_eq!(entitled.team(), Some("ENTITLED"));
        let requirement = SigningDetails {
            entitlement_team: None,
            ..entitled
        };
        assert_eq!(requirement.team(), Some("REQ"));
    }

    #[test]
    fn test_identify_recurses_once_through_bundle_executable() {
        let helper = PathBuf::from("/Applications/Foo.app/Contents/Resources/helper");
        let main = PathBuf::from("/Applications/Foo.app/Contents/MacOS/Foo");
        let mut inspector = ScriptedInspector::default();
        inspector.details.insert(helper.clone(), details("com.foo.helper", None));
        inspector.details.insert(main.clone(), details("com.foo", Some("FOOTEAM123")));
        inspector
            .bundles
            .insert(PathBuf::from("/Applications/Foo.app"), main.clone());

        let resolver = CodeIdentityResolver::new(inspector);
        let identity = resolver.identify(helper.to_str().unwrap());
        assert_eq!(identity.signing_id, "com.foo.helper");
        assert_eq!(identity.team_id, "FOOTEAM123");
        assert_eq!(resolver.inspector.lookups.lock().unwrap().as_slice(), &[helper, main]);
    }

    #[test]
    fn test_identify_does_not_recurse_into_itself() {
        let main = PathBuf::from("/Applications/Foo.app/Contents/MacOS/Foo");
        let mut inspector = ScriptedInspector::default();
        inspector.details.insert(main.clone(), details("com.foo", None));
        inspector
            .bundles
            .insert(PathBuf::from("/Applications/Foo.app"), main.clone());

        let resolver = CodeIdentityResolver::new(inspector);
        let identity = resolver.identify(main.to_str().unwrap());
        assert_eq!(identity.team_id, "");
        assert_eq!(resolver.inspector.lookups.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_identify_resolves_bundle_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Sample.app");
        std::fs::create_dir_all(bundle.join("Contents").join("MacOS")).unwrap();
        std::fs::write(bundle.join("Contents").join("Info.plist"), "<plist/>").unwrap();
        let executable = bundle.join("Contents").join("MacOS").join("Sample");

        let mut inspector = ScriptedInspector::default();
        inspector.bundles.insert(bundle.clone(), executable.clone());
        inspector
            .details
            .insert(executable, details("com.example.sample", Some("SAMPLE1234")));

        let identity = CodeIdentityResolver::new(inspector).identify(bundle.to_str().unwrap());
        assert_eq!(identity.signing_id, "com.example.sample");
        assert_eq!(identity.team_id, "SAMPLE1234");
        assert_eq!(identity.path, bundle.to_str().unwrap());
    }

    #[test]
    fn test_missing_codesign_tool_is_unsigned() {
        let tool = CodesignTool::from_config(&CodesignConfig {
            codesign_path: PathBuf::from("/nonexistent/codesign"),
            plutil_path: PathBuf::from("/nonexistent/plutil"),
        });
        assert!(matches!(
            tool.signing_details(Path::new("/bin/ls")),
            Err(IdentityError::Spawn { .. })
        ));
        assert_eq!(tool.bundle_executable(Path::new("/Applications/Foo.app")), None);
        assert!(CodeIdentityResolver::new(tool).identify("/bin/ls").is_unsigned());
    }
}
