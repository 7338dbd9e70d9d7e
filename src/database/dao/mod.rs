pub mod installed_packages;

pub use installed_packages::InstalledPackagesDao;
